//! Core row model and normalization for dayrep.
//!
//! Everything downstream of the fetch adapters speaks in [`InsightRecord`]s
//! (flat string-valued field maps) and [`NormalizedRow`]s (ordered values
//! matching a fixed [`RowSchema`]). The normalizer is deliberately lossy and
//! forgiving: malformed numeric or time fields degrade to zero, missing
//! columns become [`MISSING_VALUE`], extra source fields are ignored.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "dayrep-core";

/// Sentinel written for schema columns the source record does not carry.
pub const MISSING_VALUE: &str = "-no value-";

/// Fixed, ordered column list for one destination table.
#[derive(Debug, Clone, Copy)]
pub struct RowSchema {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// Meta ad-set insights schema, in destination column order.
pub const META_SCHEMA: RowSchema = RowSchema {
    name: "meta",
    columns: &[
        "date_start",
        "date_stop",
        "account_name",
        "publisher",
        "adset_name",
        "cpc_link",
        "ctr_link",
        "inline_link_click",
        "cpm",
        "spend",
        "avg_playtime",
    ],
};

/// Ringba call-tracking insights schema, in destination column order.
pub const RINGBA_SCHEMA: RowSchema = RowSchema {
    name: "ringba",
    columns: &[
        "date_start",
        "date_stop",
        "callCount",
        "liveCallCount",
        "endedCalls",
        "connectedCallCount",
        "payoutCount",
        "convertedCalls",
        "nonConnectedCallCount",
        "duplicateCalls",
        "blockedCalls",
        "incompleteCalls",
        "earningsPerCallGross",
        "conversionAmount",
        "payoutAmount",
        "profitGross",
        "profitMarginGross",
        "convertedPercent",
        "callLengthInSeconds",
        "avgHandleTime",
        "totalCost",
        "publisherName",
        "tag:User:sub5",
        "campaignName",
    ],
};

/// One flattened record from a fetch adapter: named metrics for a single
/// entity (ad set, or campaign/tag/publisher group) over a date range.
/// Immutable once handed to the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightRecord {
    fields: BTreeMap<String, String>,
}

impl InsightRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        self.fields.insert(column.to_string(), value.into());
    }

    pub fn with_field(mut self, column: &str, value: impl Into<String>) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

/// An ordered sequence of cell values whose length and order exactly match
/// the schema it was normalized against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub values: Vec<String>,
}

impl NormalizedRow {
    pub fn into_values(self) -> Vec<String> {
        self.values
    }
}

/// One configured ad-account group: a business label, the env var holding its
/// API token, and its member account ids. Groups are expected to be disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountGroup {
    pub label: String,
    pub token_env: String,
    #[serde(default)]
    pub accounts: Vec<String>,
}

/// First group whose member list contains `account_id` wins; no match yields
/// an empty label.
pub fn publisher_label(groups: &[AccountGroup], account_id: &str) -> String {
    groups
        .iter()
        .find(|g| g.accounts.iter().any(|a| a == account_id))
        .map(|g| g.label.clone())
        .unwrap_or_default()
}

/// Strip diacritics (NFD, drop combining marks) and replace spaces with
/// underscores. Used on free-text identifier fields before they become part
/// of a row's identity.
pub fn clean_string(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

/// `HH:MM:SS` to total seconds; anything unparseable is zero.
pub fn seconds_from_hms(text: &str) -> u32 {
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .map(|t| t.num_seconds_from_midnight())
        .unwrap_or(0)
}

/// Integer-factor truncation toward zero, not rounding:
/// `truncate(12.3456, 3)` is `12.345`.
pub fn truncate(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).trunc() / factor
}

fn project(record: &InsightRecord, schema: &RowSchema) -> NormalizedRow {
    let values = schema
        .columns
        .iter()
        .map(|col| record.get(col).unwrap_or(MISSING_VALUE).to_string())
        .collect();
    NormalizedRow { values }
}

/// Normalize one Meta ad-set insight into [`META_SCHEMA`] order. The ad-set
/// name is sanitized before projection; everything else is copied as-is.
pub fn normalize_meta_record(record: &InsightRecord) -> NormalizedRow {
    let mut record = record.clone();
    if let Some(adset) = record.get("adset_name").map(str::to_string) {
        record.set("adset_name", clean_string(&adset));
    }
    project(&record, &META_SCHEMA)
}

/// Normalize one Ringba insight group into [`RINGBA_SCHEMA`] order.
///
/// The source response carries durations as `HH:MM:SS` strings and no per-row
/// dates; call lengths become integer seconds, gross earnings are truncated
/// to three decimals, the sub5 tag is sanitized, and the requested report
/// date is injected as both date columns.
pub fn normalize_ringba_record(record: &InsightRecord, date: NaiveDate) -> NormalizedRow {
    let mut record = record.clone();

    for col in ["callLengthInSeconds", "avgHandleTime"] {
        let raw = record.get(col).unwrap_or("00:00:00").to_string();
        record.set(col, seconds_from_hms(&raw).to_string());
    }

    let earnings = record
        .get("earningsPerCallGross")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);
    record.set("earningsPerCallGross", truncate(earnings, 3).to_string());

    let tag = record.get("tag:User:sub5").unwrap_or_default().to_string();
    record.set("tag:User:sub5", clean_string(&tag));

    let day = date.format("%Y-%m-%d").to_string();
    record.set("date_start", day.clone());
    record.set("date_stop", day);

    project(&record, &RINGBA_SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<AccountGroup> {
        vec![
            AccountGroup {
                label: "BM1".into(),
                token_env: "LI1_TOKEN".into(),
                accounts: vec!["act_1".into(), "act_2".into()],
            },
            AccountGroup {
                label: "BM3".into(),
                token_env: "LI3_TOKEN".into(),
                accounts: vec!["act_3".into()],
            },
        ]
    }

    #[test]
    fn clean_string_strips_accents_and_spaces() {
        assert_eq!(clean_string("Búsqueda de Pago"), "Busqueda_de_Pago");
        assert_eq!(clean_string("plain"), "plain");
    }

    #[test]
    fn hms_parsing() {
        assert_eq!(seconds_from_hms("01:02:03"), 3723);
        assert_eq!(seconds_from_hms("00:00:00"), 0);
        assert_eq!(seconds_from_hms("bad"), 0);
        assert_eq!(seconds_from_hms(""), 0);
    }

    #[test]
    fn truncation_drops_digits_instead_of_rounding() {
        assert_eq!(truncate(12.3456, 3), 12.345);
        assert_eq!(truncate(-1.2345, 2), -1.23);
        assert_eq!(truncate(7.0, 3), 7.0);
    }

    #[test]
    fn publisher_label_first_match_wins_and_unknown_is_empty() {
        let g = groups();
        assert_eq!(publisher_label(&g, "act_2"), "BM1");
        assert_eq!(publisher_label(&g, "act_3"), "BM3");
        assert_eq!(publisher_label(&g, "act_999"), "");
    }

    #[test]
    fn meta_row_matches_schema_width_with_placeholders() {
        let record = InsightRecord::new()
            .with_field("date_start", "2024-05-01")
            .with_field("date_stop", "2024-05-01")
            .with_field("account_name", "Acme")
            .with_field("adset_name", "Búsqueda de Pago")
            .with_field("spend", "10.5");
        let row = normalize_meta_record(&record);

        assert_eq!(row.values.len(), META_SCHEMA.columns.len());
        assert_eq!(row.values[4], "Busqueda_de_Pago");
        assert_eq!(row.values[9], "10.5");
        // cpc_link was never fetched
        assert_eq!(row.values[5], MISSING_VALUE);
    }

    #[test]
    fn empty_record_normalizes_to_all_placeholders() {
        let row = normalize_meta_record(&InsightRecord::new());
        assert_eq!(row.values.len(), META_SCHEMA.columns.len());
        assert!(row.values.iter().all(|v| v == MISSING_VALUE));
    }

    #[test]
    fn ringba_row_transforms_and_injects_date() {
        let record = InsightRecord::new()
            .with_field("campaignName", "DEBT - ACA")
            .with_field("publisherName", "BM1")
            .with_field("callCount", "42")
            .with_field("callLengthInSeconds", "01:02:03")
            .with_field("avgHandleTime", "bad")
            .with_field("earningsPerCallGross", "12.3456")
            .with_field("tag:User:sub5", "vídeo uno");
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let row = normalize_ringba_record(&record, date);

        assert_eq!(row.values.len(), RINGBA_SCHEMA.columns.len());
        assert_eq!(row.values[0], "2024-05-01");
        assert_eq!(row.values[1], "2024-05-01");
        assert_eq!(row.values[18], "3723");
        assert_eq!(row.values[19], "0");
        assert_eq!(row.values[12], "12.345");
        assert_eq!(row.values[22], "video_uno");
        // liveCallCount absent in the source group
        assert_eq!(row.values[3], MISSING_VALUE);
    }
}
