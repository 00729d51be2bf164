//! Outbound adapters for the predict and mission model APIs.

use std::time::Duration;

use async_trait::async_trait;
use axwave_core::{normalize_id, BenefitCatalogEntry, UserFeatureSnapshot};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "axwave-adapters";

pub const API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{api} API request failed: {source}")]
    Request {
        api: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{api} API error: status={status}, body={body}")]
    Status {
        api: &'static str,
        status: u16,
        body: String,
    },
    #[error("{api} API returned invalid JSON: {source}")]
    Decode {
        api: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {api} API configuration: {message}")]
    Config { api: &'static str, message: String },
}

/// Flat feature + exclusion body the mission model accepts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionPayload {
    pub user_id: String,
    pub segment_id: JsonValue,
    pub gender: JsonValue,
    pub age_band: JsonValue,
    pub channel_mobile_share: f64,
    pub channel_online_share: f64,
    pub channel_offline_share: f64,
    pub domain_beauty_share: f64,
    pub domain_food_share: f64,
    pub domain_entertainment_share: f64,
    pub domain_commerce_share: f64,
    pub domain_general_share: f64,
    pub avg_amount: f64,
    pub use_ratio: f64,
    pub k: u32,
    pub exclude_mission_ids: Vec<String>,
}

impl MissionPayload {
    pub fn from_snapshot(
        user_id: &str,
        snapshot: &UserFeatureSnapshot,
        k: u32,
        exclude_mission_ids: Vec<String>,
    ) -> Self {
        let text = |column: &str| snapshot.value(column).cloned().unwrap_or(JsonValue::Null);
        Self {
            user_id: snapshot
                .value("user_id")
                .and_then(normalize_id)
                .unwrap_or_else(|| user_id.to_string()),
            segment_id: text("segment_id"),
            gender: text("gender"),
            age_band: text("age_band"),
            channel_mobile_share: snapshot.number_or_zero("channel_mobile_share"),
            channel_online_share: snapshot.number_or_zero("channel_online_share"),
            channel_offline_share: snapshot.number_or_zero("channel_offline_share"),
            domain_beauty_share: snapshot.number_or_zero("domain_beauty_share"),
            domain_food_share: snapshot.number_or_zero("domain_food_share"),
            domain_entertainment_share: snapshot.number_or_zero("domain_entertainment_share"),
            domain_commerce_share: snapshot.number_or_zero("domain_commerce_share"),
            domain_general_share: snapshot.number_or_zero("domain_general_share"),
            avg_amount: snapshot.number_or_zero("avg_amount"),
            use_ratio: snapshot.number_or_zero("use_ratio"),
            k,
            exclude_mission_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictConfig {
    pub input_data: Map<String, JsonValue>,
    pub uuid_id: String,
    pub benefits: Vec<BenefitCatalogEntry>,
}

/// `{paths, config: {input_data, uuid_id, benefits}}` body for the club predictor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictPayload {
    pub paths: Vec<String>,
    pub config: PredictConfig,
}

impl PredictPayload {
    pub fn new(
        input_data: Map<String, JsonValue>,
        uuid_id: String,
        benefits: Vec<BenefitCatalogEntry>,
    ) -> Self {
        Self {
            paths: vec!["dummy".to_string()],
            config: PredictConfig {
                input_data,
                uuid_id,
                benefits,
            },
        }
    }
}

#[async_trait]
pub trait MissionApi: Send + Sync {
    async fn recommend(
        &self,
        payload: &MissionPayload,
        timeout: Duration,
    ) -> Result<JsonValue, UpstreamError>;
}

#[async_trait]
pub trait PredictApi: Send + Sync {
    async fn predict(
        &self,
        payload: &PredictPayload,
        timeout: Duration,
    ) -> Result<JsonValue, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct ModelApiConfig {
    pub url: String,
    pub api_key: String,
}

/// JSON POST endpoint guarded by an `x-api-key` header. Only a 200 counts as success.
#[derive(Debug, Clone)]
pub struct ModelApiClient {
    api: &'static str,
    client: reqwest::Client,
    url: String,
    api_key: HeaderValue,
}

impl ModelApiClient {
    pub fn new(api: &'static str, config: ModelApiConfig) -> Result<Self, UpstreamError> {
        let api_key = HeaderValue::from_str(&config.api_key).map_err(|e| UpstreamError::Config {
            api,
            message: format!("api key is not a valid header value: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|source| UpstreamError::Request { api, source })?;
        Ok(Self {
            api,
            client,
            url: config.url,
            api_key,
        })
    }

    pub fn api(&self) -> &'static str {
        self.api
    }

    pub async fn post_json<T>(&self, body: &T, timeout: Duration) -> Result<JsonValue, UpstreamError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let api = self.api;
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, self.api_key.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|source| UpstreamError::Request { api, source })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| UpstreamError::Request { api, source })?;

        if status != StatusCode::OK {
            warn!(api, status = status.as_u16(), "upstream rejected request");
            return Err(UpstreamError::Status {
                api,
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|source| UpstreamError::Decode { api, source })
    }
}

#[derive(Debug, Clone)]
pub struct HttpMissionApi {
    inner: ModelApiClient,
}

impl HttpMissionApi {
    pub fn new(config: ModelApiConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            inner: ModelApiClient::new("Mission", config)?,
        })
    }
}

#[async_trait]
impl MissionApi for HttpMissionApi {
    async fn recommend(
        &self,
        payload: &MissionPayload,
        timeout: Duration,
    ) -> Result<JsonValue, UpstreamError> {
        self.inner
            .post_json(payload, timeout)
            .instrument(info_span!("mission_api", user_id = %payload.user_id, k = payload.k))
            .await
    }
}

#[derive(Debug, Clone)]
pub struct HttpPredictApi {
    inner: ModelApiClient,
}

impl HttpPredictApi {
    pub fn new(config: ModelApiConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            inner: ModelApiClient::new("Predict", config)?,
        })
    }
}

#[async_trait]
impl PredictApi for HttpPredictApi {
    async fn predict(
        &self,
        payload: &PredictPayload,
        timeout: Duration,
    ) -> Result<JsonValue, UpstreamError> {
        self.inner
            .post_json(payload, timeout)
            .instrument(info_span!(
                "predict_api",
                uuid_id = %payload.config.uuid_id,
                benefits = payload.config.benefits.len()
            ))
            .await
    }
}
