//! Insight-source adapters: Meta ad-set insights and Ringba call-tracking.
//!
//! Both adapters fetch raw remote records for an explicit date scope and hand
//! back flat [`InsightRecord`]s; normalization into destination schemas is
//! dayrep-core's job. The orchestrator consumes them through the
//! [`AdsInsightSource`] and [`CallInsightSource`] seams.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use dayrep_core::{publisher_label, AccountGroup, InsightRecord};
use dayrep_storage::{build_http_client, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dayrep-adapters";

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";
pub const DEFAULT_RINGBA_BASE: &str = "https://api.ringba.com/v2";

/// Metric set requested from the Graph API at ad-set level.
pub const META_INSIGHT_FIELDS: &[&str] = &[
    "spend",
    "cpm",
    "cpc",
    "adset_name",
    "cost_per_inline_link_click",
    "inline_link_click_ctr",
    "inline_link_clicks",
    "account_name",
    "video_avg_time_watched_actions",
];

// ---------------------------------------------------------------------------
// Seams consumed by the orchestrator
// ---------------------------------------------------------------------------

/// Ads-platform insights for a date range over a set of ad accounts.
/// Per-account failures degrade to a shorter result list, never an error.
#[async_trait]
pub trait AdsInsightSource: Send + Sync {
    async fn fetch_insights(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        access_token: &str,
        accounts: &[String],
        groups: &[AccountGroup],
    ) -> Result<Vec<InsightRecord>>;
}

/// One day of call-tracking aggregation. The caller must check
/// `is_successful` before using the records.
#[derive(Debug, Clone, Default)]
pub struct CallReport {
    pub is_successful: bool,
    pub records: Vec<InsightRecord>,
}

#[async_trait]
pub trait CallInsightSource: Send + Sync {
    async fn fetch_day(&self, date: NaiveDate) -> Result<CallReport>;
}

/// Ad accounts visible to one access token, for registry refreshes.
#[async_trait]
pub trait AdAccountSource: Send + Sync {
    async fn list_account_ids(&self, access_token: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Meta ads adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AdsJobError {
    #[error("insights job for {account_id} never completed after {attempts} polls")]
    JobNeverCompleted { account_id: String, attempts: usize },
    #[error("graph api reported job status {status} for {account_id}")]
    JobFailed { account_id: String, status: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Bounded poll schedule for asynchronous insights jobs. Exponential delay,
/// capped, finite: exhausting the schedule is a distinguishable
/// [`AdsJobError::JobNeverCompleted`] rather than a stalled run.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl PollPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Deserialize)]
struct StartJobResponse {
    report_run_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    async_status: String,
}

#[derive(Debug, Deserialize)]
struct InsightsPage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug)]
pub struct MetaAdsClient {
    http: reqwest::Client,
    base_url: String,
    poll: PollPolicy,
}

impl MetaAdsClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            poll,
        }
    }

    pub fn from_config(config: &HttpClientConfig, poll: PollPolicy) -> Result<Self> {
        Ok(Self::new(build_http_client(config)?, DEFAULT_GRAPH_BASE, poll))
    }

    async fn fetch_account(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        access_token: &str,
        account_id: &str,
        groups: &[AccountGroup],
    ) -> Result<Vec<InsightRecord>, AdsJobError> {
        let time_range = format!(
            r#"{{"since":"{}","until":"{}"}}"#,
            since.format("%Y-%m-%d"),
            until.format("%Y-%m-%d"),
        );
        let fields = META_INSIGHT_FIELDS.join(",");
        let job: StartJobResponse = self
            .http
            .post(format!("{}/{}/insights", self.base_url, account_id))
            .form(&[
                ("access_token", access_token),
                ("level", "adset"),
                ("fields", fields.as_str()),
                ("time_range", time_range.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(account_id, report_run_id = %job.report_run_id, "insights job started");

        self.await_job(account_id, &job.report_run_id, access_token)
            .await?;
        self.collect_results(account_id, &job.report_run_id, access_token, groups)
            .await
    }

    async fn await_job(
        &self,
        account_id: &str,
        report_run_id: &str,
        access_token: &str,
    ) -> Result<(), AdsJobError> {
        for attempt in 0..self.poll.max_attempts {
            let status: JobStatus = self
                .http
                .get(format!("{}/{}", self.base_url, report_run_id))
                .query(&[("access_token", access_token)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match status.async_status.as_str() {
                "Job Completed" => return Ok(()),
                "Job Failed" | "Job Skipped" => {
                    return Err(AdsJobError::JobFailed {
                        account_id: account_id.to_string(),
                        status: status.async_status,
                    })
                }
                _ => tokio::time::sleep(self.poll.delay_for_attempt(attempt)).await,
            }
        }
        Err(AdsJobError::JobNeverCompleted {
            account_id: account_id.to_string(),
            attempts: self.poll.max_attempts,
        })
    }

    async fn collect_results(
        &self,
        account_id: &str,
        report_run_id: &str,
        access_token: &str,
        groups: &[AccountGroup],
    ) -> Result<Vec<InsightRecord>, AdsJobError> {
        let publisher = publisher_label(groups, account_id);
        let mut records = Vec::new();
        let mut next_url = Some(format!(
            "{}/{}/insights?access_token={}&limit=500",
            self.base_url, report_run_id, access_token,
        ));

        while let Some(url) = next_url.take() {
            let page: InsightsPage = self
                .http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            for item in &page.data {
                records.push(map_insight_item(item, &publisher));
            }
            next_url = page.paging.and_then(|p| p.next);
        }
        Ok(records)
    }
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Flatten one Graph insights item into an [`InsightRecord`], renaming the
/// link metrics to their destination column names and collapsing the video
/// playtime action list to its first value.
fn map_insight_item(item: &Value, publisher: &str) -> InsightRecord {
    let mut record = InsightRecord::new();
    record.set("publisher", publisher);

    let direct = [
        ("date_start", "date_start"),
        ("date_stop", "date_stop"),
        ("account_name", "account_name"),
        ("adset_name", "adset_name"),
        ("cost_per_inline_link_click", "cpc_link"),
        ("inline_link_click_ctr", "ctr_link"),
        ("inline_link_clicks", "inline_link_click"),
        ("cpm", "cpm"),
        ("spend", "spend"),
    ];
    for (source, column) in direct {
        if let Some(value) = item.get(source).and_then(stringify) {
            record.set(column, value);
        }
    }

    let avg_playtime = item
        .get("video_avg_time_watched_actions")
        .and_then(Value::as_array)
        .and_then(|actions| actions.first())
        .and_then(|a| a.get("value"))
        .and_then(stringify)
        .unwrap_or_default();
    record.set("avg_playtime", avg_playtime);

    record
}

#[derive(Debug, Deserialize)]
struct AdAccountsPage {
    #[serde(default)]
    data: Vec<AdAccountRef>,
}

#[derive(Debug, Deserialize)]
struct AdAccountRef {
    id: String,
}

#[async_trait]
impl AdAccountSource for MetaAdsClient {
    async fn list_account_ids(&self, access_token: &str) -> Result<Vec<String>> {
        let page: AdAccountsPage = self
            .http
            .get(format!("{}/me/adaccounts", self.base_url))
            .query(&[("access_token", access_token)])
            .send()
            .await
            .context("listing ad accounts")?
            .error_for_status()
            .context("ad accounts request rejected")?
            .json()
            .await
            .context("decoding ad accounts")?;
        Ok(page.data.into_iter().map(|account| account.id).collect())
    }
}

#[async_trait]
impl AdsInsightSource for MetaAdsClient {
    async fn fetch_insights(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        access_token: &str,
        accounts: &[String],
        groups: &[AccountGroup],
    ) -> Result<Vec<InsightRecord>> {
        let mut all = Vec::new();
        for account_id in accounts {
            match self
                .fetch_account(since, until, access_token, account_id, groups)
                .await
            {
                Ok(mut records) => all.append(&mut records),
                Err(err) => warn!(account_id, error = %err, "skipping ad account"),
            }
        }
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Ringba call-tracking adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRef {
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// `aggregateFunction` is serialized explicitly as null, matching the wire
/// shape the insights endpoint expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueColumn {
    pub column: String,
    pub aggregate_function: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByColumn {
    pub column: String,
    pub direction: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroup {
    pub any_condition_to_match: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    pub column: String,
    pub value: String,
    pub is_negative_match: bool,
    pub comparison_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsRequest {
    pub report_start: String,
    pub report_end: String,
    pub group_by_columns: Vec<ColumnRef>,
    pub value_columns: Vec<ValueColumn>,
    pub order_by_columns: Vec<OrderByColumn>,
    pub format_timespans: bool,
    pub format_percentages: bool,
    pub generate_rollups: bool,
    pub max_results_per_group: u32,
    pub filters: Vec<FilterGroup>,
    pub format_time_zone: String,
}

const RINGBA_VALUE_COLUMNS: &[&str] = &[
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
];

/// Reporting window for a business day: 05:00:00Z on the requested date
/// through 04:59:59Z the following day. Not midnight-aligned; this is the
/// business-calendar convention the sheet is built around.
pub fn report_window(date: NaiveDate) -> (String, String) {
    let next = date
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX);
    (
        format!("{}T05:00:00Z", date.format("%Y-%m-%d")),
        format!("{}T04:59:59Z", next.format("%Y-%m-%d")),
    )
}

pub fn insights_request_body(report_start: &str, report_end: &str) -> InsightsRequest {
    InsightsRequest {
        report_start: report_start.to_string(),
        report_end: report_end.to_string(),
        group_by_columns: vec![
            ColumnRef {
                column: "campaignName".into(),
                display_name: Some("Campaign".into()),
            },
            ColumnRef {
                column: "tag:User:sub5".into(),
                display_name: None,
            },
            ColumnRef {
                column: "publisherName".into(),
                display_name: Some("Publisher".into()),
            },
        ],
        value_columns: RINGBA_VALUE_COLUMNS
            .iter()
            .map(|column| ValueColumn {
                column: (*column).into(),
                aggregate_function: None,
            })
            .collect(),
        order_by_columns: vec![OrderByColumn {
            column: "callCount".into(),
            direction: "desc".into(),
        }],
        format_timespans: true,
        format_percentages: true,
        generate_rollups: true,
        max_results_per_group: 1000,
        filters: vec![
            FilterGroup {
                any_condition_to_match: vec![FilterCondition {
                    column: "campaignName".into(),
                    value: "DEBT - SPA - FB +15k - Affiliates".into(),
                    is_negative_match: true,
                    comparison_type: "EQUALS".into(),
                }],
            },
            FilterGroup {
                any_condition_to_match: vec![FilterCondition {
                    column: "tag:DialedNumber:Name".into(),
                    value: "MSN".into(),
                    is_negative_match: true,
                    comparison_type: "CONTAINS".into(),
                }],
            },
        ],
        format_time_zone: "America/New_York".into(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RingbaResponse {
    #[serde(default)]
    is_successful: bool,
    #[serde(default)]
    report: Option<RingbaReportSection>,
}

#[derive(Debug, Deserialize)]
struct RingbaReportSection {
    #[serde(default)]
    records: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug)]
pub struct RingbaClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    api_token: String,
}

impl RingbaClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }

}

#[async_trait]
impl CallInsightSource for RingbaClient {
    async fn fetch_day(&self, date: NaiveDate) -> Result<CallReport> {
        let (report_start, report_end) = report_window(date);
        let body = insights_request_body(&report_start, &report_end);

        let response: RingbaResponse = self
            .http
            .post(format!("{}/{}/insights", self.base_url, self.account_id))
            .header("Authorization", format!("Token {}", self.api_token))
            .json(&body)
            .send()
            .await
            .context("posting ringba insights request")?
            .error_for_status()
            .context("ringba insights request rejected")?
            .json()
            .await
            .context("decoding ringba insights response")?;

        let records = response
            .report
            .map(|section| {
                section
                    .records
                    .iter()
                    .map(|raw| {
                        let mut record = InsightRecord::new();
                        for (column, value) in raw {
                            if let Some(text) = stringify(value) {
                                record.set(column, text);
                            }
                        }
                        record
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CallReport {
            is_successful: response.is_successful,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn poll_delays_are_exponential_and_capped() {
        let policy = PollPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(450));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(450));
    }

    #[test]
    fn report_window_is_the_five_oclock_business_day() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let (start, end) = report_window(date);
        assert_eq!(start, "2024-05-01T05:00:00Z");
        assert_eq!(end, "2024-05-02T04:59:59Z");
    }

    #[test]
    fn report_window_crosses_month_boundaries() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let (start, end) = report_window(date);
        assert_eq!(start, "2024-12-31T05:00:00Z");
        assert_eq!(end, "2025-01-01T04:59:59Z");
    }

    #[test]
    fn insights_request_serializes_to_the_expected_wire_shape() {
        let body = insights_request_body("2024-05-01T05:00:00Z", "2024-05-02T04:59:59Z");
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["reportStart"], "2024-05-01T05:00:00Z");
        assert_eq!(value["groupByColumns"][0]["column"], "campaignName");
        assert_eq!(value["groupByColumns"][0]["displayName"], "Campaign");
        // the tag column carries no display name at all
        assert!(value["groupByColumns"][1].get("displayName").is_none());
        assert_eq!(value["groupByColumns"][2]["displayName"], "Publisher");

        let value_columns = value["valueColumns"].as_array().unwrap();
        assert_eq!(value_columns.len(), 19);
        assert_eq!(value_columns[0]["column"], "callCount");
        assert!(value_columns[0]["aggregateFunction"].is_null());
        assert!(value_columns[0].get("aggregateFunction").is_some());

        assert_eq!(value["orderByColumns"][0]["direction"], "desc");
        assert_eq!(value["maxResultsPerGroup"], 1000);
        assert_eq!(value["formatTimeZone"], "America/New_York");
        assert_eq!(value["generateRollups"], true);

        let filters = value["filters"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        let campaign = &filters[0]["anyConditionToMatch"][0];
        assert_eq!(campaign["value"], "DEBT - SPA - FB +15k - Affiliates");
        assert_eq!(campaign["comparisonType"], "EQUALS");
        assert_eq!(campaign["isNegativeMatch"], true);
        let tag = &filters[1]["anyConditionToMatch"][0];
        assert_eq!(tag["column"], "tag:DialedNumber:Name");
        assert_eq!(tag["comparisonType"], "CONTAINS");
    }

    #[test]
    fn insight_items_flatten_with_renamed_link_metrics() {
        let item = json!({
            "date_start": "2024-05-01",
            "date_stop": "2024-05-01",
            "account_name": "Acme",
            "adset_name": "Adset One",
            "cost_per_inline_link_click": "1.23",
            "inline_link_clicks": 7,
            "spend": "10.50",
            "video_avg_time_watched_actions": [{"action_type": "video_view", "value": "14"}],
        });
        let record = map_insight_item(&item, "BM1");

        assert_eq!(record.get("publisher"), Some("BM1"));
        assert_eq!(record.get("cpc_link"), Some("1.23"));
        assert_eq!(record.get("inline_link_click"), Some("7"));
        assert_eq!(record.get("avg_playtime"), Some("14"));
        // never requested, never set
        assert_eq!(record.get("cpm"), None);
    }

    #[test]
    fn missing_video_stats_become_an_empty_playtime() {
        let record = map_insight_item(&json!({"spend": "1"}), "");
        assert_eq!(record.get("avg_playtime"), Some(""));
        assert_eq!(record.get("publisher"), Some(""));
    }
}
