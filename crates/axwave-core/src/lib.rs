//! Core domain model, identifier normalization and KST time helpers for AXWAVE.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "axwave-core";

pub const KST_OFFSET_SECS: i32 = 9 * 3600;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_EXCLUDE_DAYS: u32 = 7;
pub const DEFAULT_RECOMMEND_K: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid date value: {0:?}")]
    InvalidDate(String),
    #[error("invalid timestamp value: {0:?}")]
    InvalidTimestamp(String),
    #[error("exclusion window of {0} days is out of range")]
    WindowOutOfRange(u32),
}

pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).expect("UTC+9 is a valid fixed offset")
}

/// Source of "now" for window and timestamp defaults.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&kst())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

pub fn today_kst(clock: &dyn Clock) -> NaiveDate {
    clock.now().with_timezone(&kst()).date_naive()
}

/// Render a timestamp in KST as `YYYY-MM-DD HH:MM:SS`.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.with_timezone(&kst()).format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored or user-supplied timestamp. Values without an offset are read as KST.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return naive.and_local_timezone(kst()).single();
        }
    }
    None
}

/// Normalize a completion timestamp to the stored KST text form.
pub fn normalize_completed_at(raw: &str) -> Result<String, CoreError> {
    parse_timestamp(raw)
        .map(|ts| format_timestamp(&ts))
        .ok_or_else(|| CoreError::InvalidTimestamp(raw.to_string()))
}

/// Reduce a date-like value to its ISO calendar date (KST for offset-bearing input).
pub fn parse_calendar_date(raw: &str) -> Result<NaiveDate, CoreError> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }
    parse_timestamp(trimmed)
        .map(|ts| ts.with_timezone(&kst()).date_naive())
        .ok_or_else(|| CoreError::InvalidDate(raw.to_string()))
}

/// Render one identifier value as its canonical string form; empty and null yield `None`.
pub fn normalize_id(value: &JsonValue) -> Option<String> {
    let rendered = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

/// Trim, drop empties and dedupe while keeping first-seen order.
pub fn unique_strings<I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() || seen.contains(trimmed) {
            continue;
        }
        seen.insert(trimmed.to_string());
        out.push(trimmed.to_string());
    }
    out
}

pub fn unique_ids<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a JsonValue>,
{
    unique_strings(values.into_iter().filter_map(normalize_id))
}

/// Read an exclusion field that may be a list, a single scalar, or absent.
pub fn exclusion_ids(field: &JsonValue) -> Vec<String> {
    match field {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => unique_ids(items),
        scalar => unique_ids(std::iter::once(scalar)),
    }
}

/// Order-preserving union: prior ids first, then new ids not already present.
pub fn merge_ids(prior: &[String], added: &[String]) -> Vec<String> {
    unique_strings(prior.iter().chain(added.iter()).cloned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionStatus {
    #[default]
    Pending,
    Completed,
    #[serde(other)]
    Unknown,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Pending => "pending",
            MissionStatus::Completed => "completed",
            MissionStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClubStatus {
    Active,
    Left,
}

impl ClubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClubStatus::Active => "ACTIVE",
            ClubStatus::Left => "LEFT",
        }
    }
}

/// Latest behavioral feature row for a user. Columns are kept verbatim so the
/// predictor receives exactly what the table holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserFeatureSnapshot {
    columns: Map<String, JsonValue>,
}

impl UserFeatureSnapshot {
    pub fn from_columns(columns: Map<String, JsonValue>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &Map<String, JsonValue> {
        &self.columns
    }

    pub fn into_columns(self) -> Map<String, JsonValue> {
        self.columns
    }

    pub fn value(&self, column: &str) -> Option<&JsonValue> {
        self.columns.get(column)
    }

    /// Non-empty `user_id` column, if present.
    pub fn user_id(&self) -> Option<&str> {
        self.columns
            .get("user_id")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn snapshot_date(&self) -> Option<NaiveDate> {
        self.columns
            .get("snapshot_date")
            .and_then(JsonValue::as_str)
            .and_then(|raw| parse_calendar_date(raw).ok())
    }

    /// Numeric column as a finite float; missing, null or unparsable values read as `0.0`.
    pub fn number_or_zero(&self, column: &str) -> f64 {
        let parsed = match self.columns.get(column) {
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
    }
}

/// One `user_mission_pool` row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPoolEntry {
    pub user_id: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "status_or_pending")]
    pub status: MissionStatus,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub exclude_mission_ids: JsonValue,
}

fn status_or_pending<'de, D>(deserializer: D) -> Result<MissionStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<MissionStatus>::deserialize(deserializer)?.unwrap_or_default())
}

impl MissionPoolEntry {
    pub fn exclusion_ids(&self) -> Vec<String> {
        exclusion_ids(&self.exclude_mission_ids)
    }

    pub fn completed_at(&self) -> Option<DateTime<FixedOffset>> {
        self.completed_at.as_deref().and_then(parse_timestamp)
    }

    /// Completed with a readable timestamp at or after `since`.
    pub fn is_completed_since(&self, since: &DateTime<FixedOffset>) -> bool {
        self.status == MissionStatus::Completed
            && self.completed_at().is_some_and(|ts| ts >= *since)
    }
}

/// Row written by the completion recorder, upserted on `(user_id, date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionCompletionRow {
    pub user_id: String,
    pub date: NaiveDate,
    pub exclude_mission_ids: Vec<String>,
    pub status: MissionStatus,
    pub completed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClubSelection {
    pub user_id: String,
    pub club_domain: String,
    pub status: ClubStatus,
}

/// Offer row from `benefit_labeled`, forwarded untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BenefitCatalogEntry(pub Map<String, JsonValue>);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kst_at(raw: &str) -> DateTime<FixedOffset> {
        parse_timestamp(raw).expect("timestamp")
    }

    #[test]
    fn ids_are_trimmed_deduped_and_ordered() {
        let values = vec![
            json!(" m1 "),
            json!(null),
            json!(10),
            json!(""),
            json!("m1"),
            json!("10"),
            json!("m2"),
        ];
        assert_eq!(unique_ids(&values), vec!["m1", "10", "m2"]);
    }

    #[test]
    fn exclusion_field_accepts_scalar_list_and_absent() {
        assert_eq!(exclusion_ids(&json!(["a", "b", "a"])), vec!["a", "b"]);
        assert_eq!(exclusion_ids(&json!("solo")), vec!["solo"]);
        assert_eq!(exclusion_ids(&json!(7)), vec!["7"]);
        assert!(exclusion_ids(&JsonValue::Null).is_empty());
        assert!(exclusion_ids(&json!([])).is_empty());
    }

    #[test]
    fn merge_keeps_prior_order_then_appends_new() {
        let prior = vec!["b".to_string(), "c".to_string()];
        let added = vec!["a".to_string(), "b".to_string()];
        let merged = merge_ids(&prior, &added);
        assert_eq!(merged, vec!["b", "c", "a"]);
        assert_eq!(merge_ids(&merged, &added), merged);
    }

    #[test]
    fn calendar_dates_accept_date_like_values() {
        let expected = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        assert_eq!(parse_calendar_date("2026-02-24").unwrap(), expected);
        assert_eq!(parse_calendar_date("2026-02-24 21:53:00").unwrap(), expected);
        assert_eq!(parse_calendar_date("2026-02-24T21:53:00").unwrap(), expected);
        // 16:00 UTC is already the next day in KST.
        assert_eq!(
            parse_calendar_date("2026-02-23T16:00:00Z").unwrap(),
            expected
        );
        assert!(matches!(
            parse_calendar_date("yesterday"),
            Err(CoreError::InvalidDate(_))
        ));
    }

    #[test]
    fn timestamps_normalize_to_kst_text() {
        assert_eq!(
            normalize_completed_at("2026-02-24 21:53:00").unwrap(),
            "2026-02-24 21:53:00"
        );
        assert_eq!(
            normalize_completed_at("2026-02-24T12:53:00+00:00").unwrap(),
            "2026-02-24 21:53:00"
        );
        assert_eq!(
            normalize_completed_at("2026-02-24 12:53:00.123+00").unwrap(),
            "2026-02-24 21:53:00"
        );
        assert!(normalize_completed_at("not a time").is_err());
    }

    #[test]
    fn missing_or_null_numeric_features_read_as_zero() {
        let snapshot: UserFeatureSnapshot = serde_json::from_value(json!({
            "user_id": "U000001",
            "avg_amount": null,
            "use_ratio": "0.25",
            "channel_mobile_share": 0.5
        }))
        .unwrap();
        assert_eq!(snapshot.number_or_zero("avg_amount"), 0.0);
        assert_eq!(snapshot.number_or_zero("domain_food_share"), 0.0);
        assert_eq!(snapshot.number_or_zero("use_ratio"), 0.25);
        assert_eq!(snapshot.number_or_zero("channel_mobile_share"), 0.5);
        assert_eq!(snapshot.user_id(), Some("U000001"));
    }

    #[test]
    fn pool_entries_filter_on_status_and_window() {
        let since = kst_at("2026-02-20 00:00:00");
        let entry: MissionPoolEntry = serde_json::from_value(json!({
            "user_id": "U1",
            "date": "2026-02-24",
            "status": "completed",
            "completed_at": "2026-02-24T12:53:00+00:00",
            "exclude_mission_ids": [10, "11"]
        }))
        .unwrap();
        assert!(entry.is_completed_since(&since));
        assert_eq!(entry.exclusion_ids(), vec!["10", "11"]);

        let pending = MissionPoolEntry {
            status: MissionStatus::Pending,
            ..entry.clone()
        };
        assert!(!pending.is_completed_since(&since));

        let stale = MissionPoolEntry {
            completed_at: Some("2026-02-19 23:59:59".into()),
            ..entry.clone()
        };
        assert!(!stale.is_completed_since(&since));

        let unknown: MissionPoolEntry = serde_json::from_value(json!({
            "user_id": "U1",
            "status": "archived"
        }))
        .unwrap();
        assert_eq!(unknown.status, MissionStatus::Unknown);

        let null_status: MissionPoolEntry = serde_json::from_value(json!({
            "user_id": "U1",
            "date": "2026-02-24",
            "status": null,
            "completed_at": "2026-02-24 09:00:00",
            "exclude_mission_ids": ["m1"]
        }))
        .unwrap();
        assert_eq!(null_status.status, MissionStatus::Pending);
        assert!(!null_status.is_completed_since(&since));
        assert_eq!(null_status.exclusion_ids(), vec!["m1"]);
    }

    #[test]
    fn club_status_uses_uppercase_wire_form() {
        assert_eq!(serde_json::to_value(ClubStatus::Left).unwrap(), json!("LEFT"));
        assert_eq!(ClubStatus::Active.as_str(), "ACTIVE");
    }
}
