//! Row-store access for AXWAVE: narrow store traits plus PostgREST, Postgres and
//! in-memory backends.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axwave_core::{
    kst, BenefitCatalogEntry, ClubStatus, MissionCompletionRow, MissionPoolEntry,
    UserClubSelection, UserFeatureSnapshot,
};
use chrono::{DateTime, FixedOffset, NaiveDate};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "axwave-storage";

pub const FEATURE_TABLE: &str = "user_feature_30d";
pub const MISSION_POOL_TABLE: &str = "user_mission_pool";
pub const CLUB_TABLE: &str = "user_selected_club";
pub const BENEFIT_TABLE: &str = "benefit_labeled";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status} for {table}: {body}")]
    HttpStatus {
        status: u16,
        table: &'static str,
        body: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("undecodable {table} row: {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid store configuration: {0}")]
    Config(String),
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Most recent snapshot for the user by `snapshot_date`.
    async fn latest_feature(&self, user_id: &str)
        -> Result<Option<UserFeatureSnapshot>, StoreError>;
}

#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Completed rows whose `completed_at` is at or after `since`.
    async fn completed_since(
        &self,
        user_id: &str,
        since: DateTime<FixedOffset>,
    ) -> Result<Vec<MissionPoolEntry>, StoreError>;

    async fn pool_entry(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<MissionPoolEntry>, StoreError>;

    /// Insert-or-replace keyed on `(user_id, date)`; returns the rows the store echoed.
    async fn upsert_completion(
        &self,
        row: &MissionCompletionRow,
    ) -> Result<Vec<JsonValue>, StoreError>;
}

#[async_trait]
pub trait ClubStore: Send + Sync {
    /// Insert-or-replace keyed on `user_id`.
    async fn upsert_selection(&self, selection: &UserClubSelection) -> Result<(), StoreError>;

    /// Returns the number of rows touched; zero when the user has no row.
    async fn set_status(&self, user_id: &str, status: ClubStatus) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait BenefitCatalog: Send + Sync {
    async fn all_benefits(&self) -> Result<Vec<BenefitCatalogEntry>, StoreError>;
}

/// One backend viewed through each narrow trait.
#[derive(Clone)]
pub struct StoreHandles {
    pub features: Arc<dyn FeatureStore>,
    pub missions: Arc<dyn MissionStore>,
    pub clubs: Arc<dyn ClubStore>,
    pub benefits: Arc<dyn BenefitCatalog>,
}

impl StoreHandles {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: FeatureStore + MissionStore + ClubStore + BenefitCatalog + 'static,
    {
        Self {
            features: store.clone(),
            missions: store.clone(),
            clubs: store.clone(),
            benefits: store,
        }
    }
}

fn decode_rows<T: DeserializeOwned>(
    table: &'static str,
    rows: Vec<JsonValue>,
) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|source| StoreError::Decode { table, source }))
        .collect()
}

/// Table-scoped select in PostgREST query-string form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowQuery {
    columns: String,
    filters: Vec<(String, String)>,
    order: Option<String>,
    limit: Option<usize>,
}

impl RowQuery {
    pub fn select(columns: &str) -> Self {
        Self {
            columns: columns.to_string(),
            ..Default::default()
        }
    }

    pub fn filter_only() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Display) -> Self {
        self.filters.push((column.to_string(), format!("eq.{value}")));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Display) -> Self {
        self.filters.push((column.to_string(), format!("gte.{value}")));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some(format!("{column}.desc"));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(self.filters.len() + 3);
        if !self.columns.is_empty() {
            params.push(("select".to_string(), self.columns.clone()));
        }
        params.extend(self.filters.iter().cloned());
        if let Some(order) = &self.order {
            params.push(("order".to_string(), order.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
}

/// PostgREST-compatible table API (`{base_url}/rest/v1/{table}`).
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.service_key)
            .map_err(|e| StoreError::Config(format!("service key is not a valid header: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .map_err(|e| StoreError::Config(format!("service key is not a valid header: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    pub async fn select(
        &self,
        table: &'static str,
        query: &RowQuery,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let request = self.client.get(self.table_url(table)).query(&query.to_params());
        self.send(table, request).await
    }

    pub async fn upsert(
        &self,
        table: &'static str,
        on_conflict: &str,
        row: &JsonValue,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(row);
        self.send(table, request).await
    }

    pub async fn update(
        &self,
        table: &'static str,
        filters: &RowQuery,
        patch: &JsonValue,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&filters.to_params())
            .header("Prefer", "return=representation")
            .json(patch);
        self.send(table, request).await
    }

    async fn send(
        &self,
        table: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                table,
                body,
            });
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Decode { table, source })
    }
}

#[async_trait]
impl FeatureStore for RestStore {
    async fn latest_feature(
        &self,
        user_id: &str,
    ) -> Result<Option<UserFeatureSnapshot>, StoreError> {
        let query = RowQuery::select("*")
            .eq("user_id", user_id)
            .order_desc("snapshot_date")
            .limit(1);
        let rows = self
            .select(FEATURE_TABLE, &query)
            .instrument(info_span!("rest_select", table = FEATURE_TABLE, user_id))
            .await?;
        Ok(decode_rows(FEATURE_TABLE, rows)?.into_iter().next())
    }
}

#[async_trait]
impl MissionStore for RestStore {
    async fn completed_since(
        &self,
        user_id: &str,
        since: DateTime<FixedOffset>,
    ) -> Result<Vec<MissionPoolEntry>, StoreError> {
        let query = RowQuery::select("user_id,date,status,completed_at,exclude_mission_ids")
            .eq("user_id", user_id)
            .eq("status", "completed")
            .gte("completed_at", since.to_rfc3339());
        let rows = self
            .select(MISSION_POOL_TABLE, &query)
            .instrument(info_span!("rest_select", table = MISSION_POOL_TABLE, user_id))
            .await?;
        decode_rows(MISSION_POOL_TABLE, rows)
    }

    async fn pool_entry(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<MissionPoolEntry>, StoreError> {
        let query = RowQuery::select("*")
            .eq("user_id", user_id)
            .eq("date", date.format("%Y-%m-%d"))
            .limit(1);
        let rows = self.select(MISSION_POOL_TABLE, &query).await?;
        Ok(decode_rows(MISSION_POOL_TABLE, rows)?.into_iter().next())
    }

    async fn upsert_completion(
        &self,
        row: &MissionCompletionRow,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let body = serde_json::to_value(row)
            .map_err(|source| StoreError::Decode { table: MISSION_POOL_TABLE, source })?;
        self.upsert(MISSION_POOL_TABLE, "user_id,date", &body)
            .instrument(info_span!("rest_upsert", table = MISSION_POOL_TABLE, user_id = %row.user_id))
            .await
    }
}

#[async_trait]
impl ClubStore for RestStore {
    async fn upsert_selection(&self, selection: &UserClubSelection) -> Result<(), StoreError> {
        let body = serde_json::to_value(selection)
            .map_err(|source| StoreError::Decode { table: CLUB_TABLE, source })?;
        self.upsert(CLUB_TABLE, "user_id", &body).await?;
        Ok(())
    }

    async fn set_status(&self, user_id: &str, status: ClubStatus) -> Result<u64, StoreError> {
        let filters = RowQuery::filter_only().eq("user_id", user_id);
        let rows = self
            .update(CLUB_TABLE, &filters, &json!({ "status": status }))
            .await?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl BenefitCatalog for RestStore {
    async fn all_benefits(&self) -> Result<Vec<BenefitCatalogEntry>, StoreError> {
        let rows = self.select(BENEFIT_TABLE, &RowQuery::select("*")).await?;
        decode_rows(BENEFIT_TABLE, rows)
    }
}

/// Direct Postgres access for deployments that own the tables.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_json_rows(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<JsonValue, _>("row")?);
        }
        Ok(out)
    }
}

#[async_trait]
impl FeatureStore for PgStore {
    async fn latest_feature(
        &self,
        user_id: &str,
    ) -> Result<Option<UserFeatureSnapshot>, StoreError> {
        let rows = self
            .fetch_json_rows(
                sqlx::query(
                    r#"
                    SELECT to_jsonb(f) AS row
                      FROM user_feature_30d f
                     WHERE f.user_id = $1
                     ORDER BY f.snapshot_date DESC
                     LIMIT 1
                    "#,
                )
                .bind(user_id),
            )
            .await?;
        Ok(decode_rows(FEATURE_TABLE, rows)?.into_iter().next())
    }
}

#[async_trait]
impl MissionStore for PgStore {
    async fn completed_since(
        &self,
        user_id: &str,
        since: DateTime<FixedOffset>,
    ) -> Result<Vec<MissionPoolEntry>, StoreError> {
        // completed_at holds KST wall-clock time without an offset.
        let since_local = since.with_timezone(&kst()).naive_local();
        let rows = self
            .fetch_json_rows(
                sqlx::query(
                    r#"
                    SELECT to_jsonb(p) AS row
                      FROM user_mission_pool p
                     WHERE p.user_id = $1
                       AND p.status = 'completed'
                       AND p.completed_at >= $2
                    "#,
                )
                .bind(user_id)
                .bind(since_local),
            )
            .await?;
        decode_rows(MISSION_POOL_TABLE, rows)
    }

    async fn pool_entry(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<MissionPoolEntry>, StoreError> {
        let rows = self
            .fetch_json_rows(
                sqlx::query(
                    r#"
                    SELECT to_jsonb(p) AS row
                      FROM user_mission_pool p
                     WHERE p.user_id = $1
                       AND p.date = $2
                     LIMIT 1
                    "#,
                )
                .bind(user_id)
                .bind(date),
            )
            .await?;
        Ok(decode_rows(MISSION_POOL_TABLE, rows)?.into_iter().next())
    }

    async fn upsert_completion(
        &self,
        row: &MissionCompletionRow,
    ) -> Result<Vec<JsonValue>, StoreError> {
        self.fetch_json_rows(
            sqlx::query(
                r#"
                INSERT INTO user_mission_pool AS p
                       (user_id, date, exclude_mission_ids, status, completed_at)
                VALUES ($1, $2, $3, $4, $5::timestamp)
                ON CONFLICT (user_id, date) DO UPDATE
                   SET exclude_mission_ids = EXCLUDED.exclude_mission_ids,
                       status = EXCLUDED.status,
                       completed_at = EXCLUDED.completed_at
                RETURNING to_jsonb(p) AS row
                "#,
            )
            .bind(&row.user_id)
            .bind(row.date)
            .bind(sqlx::types::Json(&row.exclude_mission_ids))
            .bind(row.status.as_str())
            .bind(&row.completed_at),
        )
        .await
    }
}

#[async_trait]
impl ClubStore for PgStore {
    async fn upsert_selection(&self, selection: &UserClubSelection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_selected_club (user_id, club_domain, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
               SET club_domain = EXCLUDED.club_domain,
                   status = EXCLUDED.status
            "#,
        )
        .bind(&selection.user_id)
        .bind(&selection.club_domain)
        .bind(selection.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, user_id: &str, status: ClubStatus) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE user_selected_club SET status = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BenefitCatalog for PgStore {
    async fn all_benefits(&self) -> Result<Vec<BenefitCatalogEntry>, StoreError> {
        let rows = self
            .fetch_json_rows(sqlx::query("SELECT to_jsonb(b) AS row FROM benefit_labeled b"))
            .await?;
        decode_rows(BENEFIT_TABLE, rows)
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    features: Vec<UserFeatureSnapshot>,
    mission_pool: Vec<MissionPoolEntry>,
    clubs: BTreeMap<String, UserClubSelection>,
    benefits: Vec<BenefitCatalogEntry>,
}

/// In-process tables with the same upsert keys as the real backends.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_feature(&self, snapshot: UserFeatureSnapshot) {
        self.tables.lock().await.features.push(snapshot);
    }

    pub async fn insert_pool_entry(&self, entry: MissionPoolEntry) {
        self.tables.lock().await.mission_pool.push(entry);
    }

    pub async fn insert_benefit(&self, benefit: BenefitCatalogEntry) {
        self.tables.lock().await.benefits.push(benefit);
    }

    pub async fn club_selection(&self, user_id: &str) -> Option<UserClubSelection> {
        self.tables.lock().await.clubs.get(user_id).cloned()
    }

    pub async fn pool_entries(&self, user_id: &str) -> Vec<MissionPoolEntry> {
        self.tables
            .lock()
            .await
            .mission_pool
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    async fn latest_feature(
        &self,
        user_id: &str,
    ) -> Result<Option<UserFeatureSnapshot>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .features
            .iter()
            .filter(|s| s.user_id() == Some(user_id))
            .max_by_key(|s| s.snapshot_date())
            .cloned())
    }
}

#[async_trait]
impl MissionStore for MemoryStore {
    async fn completed_since(
        &self,
        user_id: &str,
        since: DateTime<FixedOffset>,
    ) -> Result<Vec<MissionPoolEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .mission_pool
            .iter()
            .filter(|e| e.user_id == user_id && e.is_completed_since(&since))
            .cloned()
            .collect())
    }

    async fn pool_entry(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<MissionPoolEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .mission_pool
            .iter()
            .find(|e| e.user_id == user_id && e.date == Some(date))
            .cloned())
    }

    async fn upsert_completion(
        &self,
        row: &MissionCompletionRow,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let entry = MissionPoolEntry {
            user_id: row.user_id.clone(),
            date: Some(row.date),
            status: row.status,
            completed_at: Some(row.completed_at.clone()),
            exclude_mission_ids: json!(row.exclude_mission_ids),
        };
        let echoed = serde_json::to_value(&entry)
            .map_err(|source| StoreError::Decode { table: MISSION_POOL_TABLE, source })?;

        let mut tables = self.tables.lock().await;
        match tables
            .mission_pool
            .iter_mut()
            .find(|e| e.user_id == row.user_id && e.date == Some(row.date))
        {
            Some(existing) => *existing = entry,
            None => tables.mission_pool.push(entry),
        }
        debug!(user_id = %row.user_id, date = %row.date, "memory upsert");
        Ok(vec![echoed])
    }
}

#[async_trait]
impl ClubStore for MemoryStore {
    async fn upsert_selection(&self, selection: &UserClubSelection) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .clubs
            .insert(selection.user_id.clone(), selection.clone());
        Ok(())
    }

    async fn set_status(&self, user_id: &str, status: ClubStatus) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.clubs.get_mut(user_id) {
            Some(selection) => {
                selection.status = status;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl BenefitCatalog for MemoryStore {
    async fn all_benefits(&self) -> Result<Vec<BenefitCatalogEntry>, StoreError> {
        Ok(self.tables.lock().await.benefits.clone())
    }
}
