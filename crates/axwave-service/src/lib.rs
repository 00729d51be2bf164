//! Mission and club flows shared by every AXWAVE backend variant.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axwave_adapters::{
    HttpMissionApi, HttpPredictApi, MissionApi, MissionPayload, ModelApiConfig, PredictApi,
    PredictPayload, UpstreamError, DEFAULT_TIMEOUT,
};
use axwave_core::{
    format_timestamp, merge_ids, normalize_completed_at, parse_calendar_date, today_kst,
    unique_ids, unique_strings, Clock, ClubStatus, CoreError, MissionCompletionRow, MissionPoolEntry,
    MissionStatus, SystemClock, UserClubSelection, UserFeatureSnapshot, DEFAULT_EXCLUDE_DAYS,
    DEFAULT_RECOMMEND_K,
};
use axwave_storage::{
    BenefitCatalog, ClubStore, FeatureStore, MemoryStore, MissionStore, PgStore, RestStore,
    RestStoreConfig, StoreError, StoreHandles,
};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "axwave-service";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("user_feature_30d not found for user_id={user_id}")]
    FeatureNotFound { user_id: String },
    #[error(transparent)]
    InvalidInput(#[from] CoreError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which route family a deployment serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceVariant {
    Club,
    Mission,
    #[default]
    All,
}

impl ServiceVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceVariant::Club => "club",
            ServiceVariant::Mission => "mission",
            ServiceVariant::All => "all",
        }
    }

    pub fn serves_club(&self) -> bool {
        matches!(self, ServiceVariant::Club | ServiceVariant::All)
    }

    pub fn serves_missions(&self) -> bool {
        matches!(self, ServiceVariant::Mission | ServiceVariant::All)
    }
}

impl fmt::Display for ServiceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "club" | "campaign" => Ok(ServiceVariant::Club),
            "mission" | "missions" => Ok(ServiceVariant::Mission),
            "all" => Ok(ServiceVariant::All),
            other => Err(ConfigError::Invalid {
                key: "AXWAVE_VARIANT",
                value: other.to_string(),
                reason: "expected club, mission or all".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Rest { url: String, service_key: String },
    Postgres { database_url: String },
    Memory,
}

impl StoreConfig {
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = lookup("STORE_BACKEND").unwrap_or_else(|| "rest".to_string());
        match backend.trim().to_ascii_lowercase().as_str() {
            "rest" | "supabase" => Ok(StoreConfig::Rest {
                url: required(lookup, "SUPABASE_URL")?,
                service_key: required(lookup, "SUPABASE_SERVICE_KEY")?,
            }),
            "postgres" => Ok(StoreConfig::Postgres {
                database_url: required(lookup, "DATABASE_URL")?,
            }),
            "memory" => Ok(StoreConfig::Memory),
            other => Err(ConfigError::Invalid {
                key: "STORE_BACKEND",
                value: other.to_string(),
                reason: "expected rest, postgres or memory".to_string(),
            }),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreConfig::Rest { .. } => "rest",
            StoreConfig::Postgres { .. } => "postgres",
            StoreConfig::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub variant: ServiceVariant,
    pub bind_host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub store: StoreConfig,
    pub predict_api: Option<ModelApiConfig>,
    pub mission_api: Option<ModelApiConfig>,
    pub upstream_timeout: Duration,
}

impl AppConfig {
    pub fn from_env(variant_override: Option<ServiceVariant>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), variant_override)
    }

    pub fn from_lookup<F>(
        lookup: F,
        variant_override: Option<ServiceVariant>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let variant = match variant_override {
            Some(v) => v,
            None => lookup("AXWAVE_VARIANT")
                .map(|v| v.parse::<ServiceVariant>())
                .transpose()?
                .unwrap_or_default(),
        };

        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    key: "PORT",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => 8000,
        };

        let upstream_timeout = match lookup("UPSTREAM_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse::<u64>().map_err(
                |e: std::num::ParseIntError| ConfigError::Invalid {
                    key: "UPSTREAM_TIMEOUT_SECS",
                    value: raw.clone(),
                    reason: e.to_string(),
                },
            )?),
            None => DEFAULT_TIMEOUT,
        };

        let predict_api = if variant.serves_club() {
            Some(ModelApiConfig {
                url: required(&lookup, "PREDICT_API_URL")?,
                api_key: required(&lookup, "PREDICT_API_KEY")?,
            })
        } else {
            None
        };

        let mission_api = if variant.serves_missions() {
            Some(ModelApiConfig {
                url: required(&lookup, "MISSION_API_URL")?,
                api_key: required(&lookup, "MISSION_API_KEY")?,
            })
        } else {
            None
        };

        Ok(Self {
            variant,
            bind_host: lookup("AXWAVE_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            api_key: lookup("API_KEY").filter(|k| !k.trim().is_empty()),
            store: StoreConfig::from_lookup(&lookup)?,
            predict_api,
            mission_api,
            upstream_timeout,
        })
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Start of the trailing exclusion window; fails when it falls outside the calendar range.
pub fn window_start(
    now: DateTime<FixedOffset>,
    days: u32,
) -> Result<DateTime<FixedOffset>, CoreError> {
    ChronoDuration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or(CoreError::WindowOutOfRange(days))
}

/// Fold completed rows inside the window into one ordered, unique id list.
pub fn fold_exclusion_window(
    rows: &[MissionPoolEntry],
    since: &DateTime<FixedOffset>,
) -> Vec<String> {
    unique_strings(
        rows.iter()
            .filter(|row| row.is_completed_since(since))
            .flat_map(MissionPoolEntry::exclusion_ids),
    )
}

async fn fetch_latest_feature(
    features: &dyn FeatureStore,
    user_id: &str,
) -> Result<UserFeatureSnapshot, ServiceError> {
    features
        .latest_feature(user_id)
        .await?
        .ok_or_else(|| ServiceError::FeatureNotFound {
            user_id: user_id.to_string(),
        })
}

#[derive(Debug, Clone, Copy)]
pub struct RecommendOptions {
    pub k: u32,
    pub exclude_days: u32,
    pub timeout: Duration,
}

impl Default for RecommendOptions {
    fn default() -> Self {
        Self {
            k: DEFAULT_RECOMMEND_K,
            exclude_days: DEFAULT_EXCLUDE_DAYS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionInput {
    pub user_id: String,
    pub date: Option<String>,
    pub completed_mission_ids: Vec<JsonValue>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionReceipt {
    pub saved: MissionCompletionRow,
    pub stored: Vec<JsonValue>,
}

/// Mission recommendation and completion bookkeeping.
pub struct MissionService {
    features: Arc<dyn FeatureStore>,
    missions: Arc<dyn MissionStore>,
    api: Arc<dyn MissionApi>,
    clock: Arc<dyn Clock>,
}

impl MissionService {
    pub fn new(
        features: Arc<dyn FeatureStore>,
        missions: Arc<dyn MissionStore>,
        api: Arc<dyn MissionApi>,
    ) -> Self {
        Self {
            features,
            missions,
            api,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Ids completed by the user within the last `days`, relative to `now` (or the clock).
    pub async fn exclusion_window(
        &self,
        user_id: &str,
        days: u32,
        now: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<String>, ServiceError> {
        let now = now.unwrap_or_else(|| self.clock.now());
        let since = window_start(now, days)?;
        let rows = self.missions.completed_since(user_id, since).await?;
        Ok(fold_exclusion_window(&rows, &since))
    }

    pub async fn recommend(
        &self,
        user_id: &str,
        options: RecommendOptions,
    ) -> Result<JsonValue, ServiceError> {
        let span = info_span!("missions_recommend", user_id, k = options.k);
        async {
            let feature = fetch_latest_feature(self.features.as_ref(), user_id).await?;
            let exclude_ids = self
                .exclusion_window(user_id, options.exclude_days, None)
                .await?;
            info!(excluded = exclude_ids.len(), "calling mission api");

            let payload = MissionPayload::from_snapshot(user_id, &feature, options.k, exclude_ids);
            Ok(self.api.recommend(&payload, options.timeout).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn record_completion(
        &self,
        input: CompletionInput,
    ) -> Result<CompletionReceipt, ServiceError> {
        let span = info_span!("missions_complete", user_id = %input.user_id);
        async {
            let date = match input.date.as_deref().map(str::trim) {
                Some(raw) if !raw.is_empty() => parse_calendar_date(raw)?,
                _ => today_kst(self.clock.as_ref()),
            };
            let completed_at = match input.completed_at.as_deref().map(str::trim) {
                Some(raw) if !raw.is_empty() => normalize_completed_at(raw)?,
                _ => format_timestamp(&self.clock.now()),
            };
            let added = unique_ids(&input.completed_mission_ids);

            let prior = self
                .missions
                .pool_entry(&input.user_id, date)
                .await?
                .map(|entry| entry.exclusion_ids())
                .unwrap_or_default();
            let merged = merge_ids(&prior, &added);

            let row = MissionCompletionRow {
                user_id: input.user_id.clone(),
                date,
                exclude_mission_ids: merged,
                status: MissionStatus::Completed,
                completed_at,
            };
            let stored = self.missions.upsert_completion(&row).await?;
            info!(%date, ids = row.exclude_mission_ids.len(), "completion recorded");

            Ok(CompletionReceipt { saved: row, stored })
        }
        .instrument(span)
        .await
    }
}

/// Club prediction and selection bookkeeping.
pub struct ClubService {
    features: Arc<dyn FeatureStore>,
    clubs: Arc<dyn ClubStore>,
    benefits: Arc<dyn BenefitCatalog>,
    api: Arc<dyn PredictApi>,
    timeout: Duration,
}

impl ClubService {
    pub fn new(
        features: Arc<dyn FeatureStore>,
        clubs: Arc<dyn ClubStore>,
        benefits: Arc<dyn BenefitCatalog>,
        api: Arc<dyn PredictApi>,
    ) -> Self {
        Self {
            features,
            clubs,
            benefits,
            api,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn predict(&self, user_id: &str, segment_id: &str) -> Result<JsonValue, ServiceError> {
        let uuid_id = Uuid::new_v4().to_string();
        let span = info_span!("club_predict", user_id, %uuid_id);
        async {
            let feature = fetch_latest_feature(self.features.as_ref(), user_id).await?;
            let mut input_data = feature.into_columns();
            input_data.insert("user_id".to_string(), json!(user_id));
            input_data.insert("segment_id".to_string(), json!(segment_id));

            let benefits = self.benefits.all_benefits().await?;
            info!(benefits = benefits.len(), "calling predict api");

            let payload = PredictPayload::new(input_data, uuid_id.clone(), benefits);
            Ok(self.api.predict(&payload, self.timeout).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn select(&self, user_id: &str, club_domain: &str) -> Result<(), ServiceError> {
        let selection = UserClubSelection {
            user_id: user_id.to_string(),
            club_domain: club_domain.to_string(),
            status: ClubStatus::Active,
        };
        self.clubs.upsert_selection(&selection).await?;
        info!(user_id, club_domain, "club selected");
        Ok(())
    }

    pub async fn leave(&self, user_id: &str) -> Result<(), ServiceError> {
        let touched = self.clubs.set_status(user_id, ClubStatus::Left).await?;
        if touched == 0 {
            info!(user_id, "leave requested without a selected club");
        } else {
            info!(user_id, "club left");
        }
        Ok(())
    }
}

/// Services mounted for one variant; a family the variant does not serve stays `None`.
#[derive(Clone, Default)]
pub struct Services {
    pub missions: Option<Arc<MissionService>>,
    pub clubs: Option<Arc<ClubService>>,
}

pub async fn connect_store(config: &StoreConfig, timeout: Duration) -> anyhow::Result<StoreHandles> {
    let handles = match config {
        StoreConfig::Rest { url, service_key } => {
            let store = RestStore::new(RestStoreConfig {
                base_url: url.clone(),
                service_key: service_key.clone(),
                timeout,
            })
            .context("building REST store client")?;
            StoreHandles::from_store(Arc::new(store))
        }
        StoreConfig::Postgres { database_url } => {
            let store = PgStore::connect(database_url)
                .await
                .context("connecting to postgres")?;
            StoreHandles::from_store(Arc::new(store))
        }
        StoreConfig::Memory => {
            warn!("using in-memory store; data is lost on shutdown");
            StoreHandles::from_store(Arc::new(MemoryStore::new()))
        }
    };
    Ok(handles)
}

/// Apply the bundled SQL migrations; only the postgres backend owns its schema.
pub async fn run_migrations(config: &StoreConfig) -> anyhow::Result<()> {
    let StoreConfig::Postgres { database_url } = config else {
        anyhow::bail!(
            "migrations need STORE_BACKEND=postgres, got {}",
            config.backend_name()
        );
    };
    let store = PgStore::connect(database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let stores = connect_store(&config.store, config.upstream_timeout).await?;
    services_from_parts(config, stores)
}

/// Wire services for the configured variant over an already connected store.
pub fn services_from_parts(
    config: &AppConfig,
    stores: StoreHandles,
) -> anyhow::Result<Services> {
    let mut services = Services::default();

    if let Some(api) = &config.mission_api {
        let client = HttpMissionApi::new(api.clone()).context("building mission api client")?;
        services.missions = Some(Arc::new(MissionService::new(
            stores.features.clone(),
            stores.missions.clone(),
            Arc::new(client),
        )));
    }

    if let Some(api) = &config.predict_api {
        let client = HttpPredictApi::new(api.clone()).context("building predict api client")?;
        services.clubs = Some(Arc::new(
            ClubService::new(
                stores.features.clone(),
                stores.clubs.clone(),
                stores.benefits.clone(),
                Arc::new(client),
            )
            .with_timeout(config.upstream_timeout),
        ));
    }

    Ok(services)
}
