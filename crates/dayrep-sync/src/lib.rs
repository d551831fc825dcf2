//! Report orchestration: cleanup, fetch, normalize, incremental sync, notify.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use dayrep_adapters::{
    AdAccountSource, AdsInsightSource, CallInsightSource, MetaAdsClient, PollPolicy, RingbaClient,
    DEFAULT_GRAPH_BASE, DEFAULT_RINGBA_BASE,
};
use dayrep_core::{
    normalize_meta_record, normalize_ringba_record, AccountGroup, InsightRecord, NormalizedRow,
    META_SCHEMA, RINGBA_SCHEMA,
};
use dayrep_storage::{
    build_http_client, CleanupRunner, DiscordNotifier, GoogleAuth, HttpClientConfig, Notifier,
    RowSink, ScriptClient, SheetsClient, StagingStore, DEFAULT_DISCORD_BASE, DEFAULT_SCRIPT_BASE,
    DEFAULT_SHEETS_BASE,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dayrep-sync";

/// Fixed per-run staging file names, overwritten each run.
pub const META_STAGING_FILE: &str = "general_report.csv";
pub const RINGBA_STAGING_FILE: &str = "ringba_insights_report.csv";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Explicit run configuration built once at startup. Required values that are
/// absent stay empty and surface as call-time failures against the remote
/// APIs, not at construction.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub spreadsheet_id: String,
    pub script_id: String,
    pub token_file: PathBuf,
    pub insights_folder: PathBuf,
    pub ringba_insights_folder: PathBuf,
    pub meta_range: String,
    pub ringba_range: String,
    pub meta_sheet: String,
    pub ringba_sheet: String,
    pub ringba_account_id: String,
    pub ringba_api_token: String,
    pub discord_bot_token: String,
    pub notify_user_ids: Vec<String>,
    pub accounts_file: PathBuf,
    pub exclude_account_ids: Vec<String>,
    pub scheduler_enabled: bool,
    pub report_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl ReportConfig {
    pub fn from_env() -> Self {
        Self {
            spreadsheet_id: std::env::var("SPREADSHEET_ID").unwrap_or_default(),
            script_id: std::env::var("SCRIPT_ID").unwrap_or_default(),
            token_file: std::env::var("GOOGLE_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("token.json")),
            insights_folder: std::env::var("INSIGHTS_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("insights")),
            ringba_insights_folder: std::env::var("RINGBA_INSIGHTS_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("ringba_insights")),
            meta_range: std::env::var("META_RANGE_NAME")
                .unwrap_or_else(|_| "test meta!A1".to_string()),
            ringba_range: std::env::var("RINGBA_RANGE_NAME")
                .unwrap_or_else(|_| "test ringba!A1".to_string()),
            meta_sheet: std::env::var("META_SHEET_NAME")
                .unwrap_or_else(|_| "test meta".to_string()),
            ringba_sheet: std::env::var("RINGBA_SHEET_NAME")
                .unwrap_or_else(|_| "test ringba".to_string()),
            ringba_account_id: std::env::var("RINGBA_ACCOUNT_ID").unwrap_or_default(),
            ringba_api_token: std::env::var("RINGBA_API_TOKEN").unwrap_or_default(),
            discord_bot_token: std::env::var("DISCORD_TOKEN").unwrap_or_default(),
            notify_user_ids: std::env::var("REPORT_NOTIFY_USER_IDS")
                .unwrap_or_else(|_| "274730726174490624,836235560107769867".to_string())
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            accounts_file: std::env::var("ACCOUNTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("accounts.yaml")),
            exclude_account_ids: std::env::var("EXCLUDE_ACCOUNT_IDS")
                .unwrap_or_else(|_| "act_1079103783395840,act_418878090721644".to_string())
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            scheduler_enabled: std::env::var("DAYREP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            report_cron: std::env::var("REPORT_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
            http_timeout_secs: std::env::var("DAYREP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("DAYREP_USER_AGENT")
                .unwrap_or_else(|_| "dayrep-bot/0.1".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRegistry {
    pub groups: Vec<AccountGroup>,
}

pub fn load_account_registry(path: &Path) -> Result<AccountRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One account group paired with its resolved API token. A group whose token
/// env var is unset still participates in publisher labeling but is skipped
/// at fetch time.
#[derive(Debug, Clone)]
pub struct FetchGroup {
    pub group: AccountGroup,
    pub access_token: Option<String>,
}

pub fn resolve_group_tokens(groups: Vec<AccountGroup>) -> Vec<FetchGroup> {
    groups
        .into_iter()
        .map(|group| {
            let access_token = std::env::var(&group.token_env).ok();
            if access_token.is_none() {
                warn!(group = %group.label, env = %group.token_env, "no access token configured");
            }
            FetchGroup {
                group,
                access_token,
            }
        })
        .collect()
}

/// Rebuild each group's account list from the ads platform, drop the
/// configured exclusions, and rewrite the registry file. A group without a
/// resolved token keeps its current accounts; a failed fetch empties the
/// group for this refresh.
pub async fn refresh_account_registry(
    path: &Path,
    groups: &[FetchGroup],
    source: &dyn AdAccountSource,
    exclude: &[String],
) -> Result<AccountRegistry> {
    let mut refreshed = Vec::with_capacity(groups.len());
    for fetch_group in groups {
        let mut group = fetch_group.group.clone();
        match &fetch_group.access_token {
            None => {
                warn!(group = %group.label, "no access token; keeping current accounts");
            }
            Some(token) => match source.list_account_ids(token).await {
                Ok(ids) => {
                    group.accounts = ids.into_iter().filter(|id| !exclude.contains(id)).collect();
                    info!(group = %group.label, accounts = group.accounts.len(), "accounts retrieved");
                }
                Err(err) => {
                    warn!(group = %group.label, error = %err, "account fetch failed; group emptied");
                    group.accounts.clear();
                }
            },
        }
        refreshed.push(group);
    }

    let registry = AccountRegistry { groups: refreshed };
    let text = serde_yaml::to_string(&registry).context("serializing account registry")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    info!(file = %path.display(), "account registry updated");
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Incremental sync engine
// ---------------------------------------------------------------------------

/// Append staged rows not already present in the destination.
///
/// A row's identity is the full equality of its serialized values; two
/// value-identical rows are duplicates even when they describe distinct
/// events. The staged file is read once, in order; the delta keeps that
/// order and goes out in a single append call. Every failure path degrades
/// to "zero appended" with a warn line naming the failing step, so a remote
/// failure is at least distinguishable from a true zero delta in the logs.
pub async fn sync_staged(
    staging_path: &Path,
    range_anchor: &str,
    sink: &dyn RowSink,
) -> Vec<Vec<String>> {
    let candidates = match StagingStore::read_rows(staging_path) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(file = %staging_path.display(), error = %err, "staged rows unreadable; zero appended");
            return Vec::new();
        }
    };
    if candidates.is_empty() {
        return Vec::new();
    }

    let existing = match sink.existing_rows(range_anchor).await {
        Ok(existing) => existing,
        Err(err) => {
            warn!(range_anchor, error = %err, "existing rows unavailable; zero appended");
            return Vec::new();
        }
    };

    let delta: Vec<Vec<String>> = candidates
        .into_iter()
        .filter(|row| !existing.contains(row))
        .collect();
    if delta.is_empty() {
        info!(range_anchor, "no new rows to append");
        return Vec::new();
    }

    match sink.append_rows(range_anchor, &delta).await {
        Ok(()) => {
            info!(range_anchor, appended = delta.len(), "appended new rows");
            delta
        }
        Err(err) => {
            warn!(range_anchor, error = %err, "append failed; rows not recorded this run");
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Caller-visible milestone messages (the ephemeral command responses of the
/// chat front end).
pub trait ProgressHook: Send + Sync {
    fn on_status(&self, message: &str);
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressHook for NoopProgress {
    fn on_status(&self, _message: &str) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub meta_rows_appended: usize,
    pub ringba_rows_appended: usize,
}

pub struct ReportPipeline {
    config: ReportConfig,
    groups: Vec<FetchGroup>,
    meta_staging: StagingStore,
    ringba_staging: StagingStore,
    ads: Arc<dyn AdsInsightSource>,
    calls: Arc<dyn CallInsightSource>,
    cleanup: Arc<dyn CleanupRunner>,
    sheets: Arc<dyn RowSink>,
    notifier: Arc<dyn Notifier>,
    progress: Box<dyn ProgressHook>,
}

impl ReportPipeline {
    pub fn new(config: ReportConfig) -> Result<Self> {
        let registry = load_account_registry(&config.accounts_file)?;
        let groups = resolve_group_tokens(registry.groups);

        let http = build_http_client(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let auth = Arc::new(GoogleAuth::new(&config.token_file, http.clone()));

        let sheets = Arc::new(SheetsClient::new(
            http.clone(),
            Arc::clone(&auth),
            DEFAULT_SHEETS_BASE,
            config.spreadsheet_id.clone(),
        ));
        let cleanup = Arc::new(ScriptClient::new(
            http.clone(),
            auth,
            DEFAULT_SCRIPT_BASE,
            config.script_id.clone(),
        ));
        let notifier = Arc::new(DiscordNotifier::new(
            http.clone(),
            DEFAULT_DISCORD_BASE,
            config.discord_bot_token.clone(),
        ));
        let ads = Arc::new(MetaAdsClient::new(
            http.clone(),
            DEFAULT_GRAPH_BASE,
            PollPolicy::default(),
        ));
        let calls = Arc::new(RingbaClient::new(
            http,
            DEFAULT_RINGBA_BASE,
            config.ringba_account_id.clone(),
            config.ringba_api_token.clone(),
        ));

        Ok(Self::from_parts(
            config, groups, ads, calls, cleanup, sheets, notifier,
        ))
    }

    pub fn from_parts(
        config: ReportConfig,
        groups: Vec<FetchGroup>,
        ads: Arc<dyn AdsInsightSource>,
        calls: Arc<dyn CallInsightSource>,
        cleanup: Arc<dyn CleanupRunner>,
        sheets: Arc<dyn RowSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let meta_staging = StagingStore::new(config.insights_folder.clone());
        let ringba_staging = StagingStore::new(config.ringba_insights_folder.clone());
        Self {
            config,
            groups,
            meta_staging,
            ringba_staging,
            ads,
            calls,
            cleanup,
            sheets,
            notifier,
            progress: Box::<NoopProgress>::default(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressHook>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Run the whole report for one date. Cleanup failure is fatal; every
    /// later stage degrades independently and the run always reaches the
    /// notification step.
    pub async fn run_for_date(&self, date: NaiveDate, triggered_by: &str) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %date, triggered_by, "report run started");

        let (meta_clean, ringba_clean) = tokio::join!(
            self.cleanup
                .delete_rows_for_date(&self.config.meta_sheet, date),
            self.cleanup
                .delete_rows_for_date(&self.config.ringba_sheet, date),
        );
        if let Err(err) = meta_clean.and(ringba_clean) {
            self.progress.on_status("Cleanup script failed.");
            return Err(err).context("cleanup precondition failed");
        }

        let records = self.fetch_all_meta(date).await;
        let rows: Vec<NormalizedRow> = records.iter().map(normalize_meta_record).collect();
        let meta_appended = match self
            .meta_staging
            .write_rows(META_STAGING_FILE, &META_SCHEMA, &rows)
        {
            Ok(path) => {
                let appended =
                    sync_staged(&path, &self.config.meta_range, self.sheets.as_ref()).await;
                self.progress
                    .on_status(&format!("Meta insights saved to {}.", path.display()));
                appended
            }
            Err(err) => {
                warn!(error = %err, "meta staging write failed");
                self.progress.on_status("Failed to save Meta CSV.");
                Vec::new()
            }
        };

        let ringba_appended = self.run_ringba_branch(date).await;

        let finished_at = Utc::now();
        let message = format!(
            "{} - {} ran report for {}. Meta rows: {}, Ringba rows: {}",
            finished_at.format("%Y-%m-%d %H:%M:%S"),
            triggered_by,
            date.format("%Y-%m-%d"),
            meta_appended.len(),
            ringba_appended.len(),
        );
        for user_id in &self.config.notify_user_ids {
            if let Err(err) = self.notifier.direct_message(user_id, &message).await {
                warn!(user_id, error = %err, "operator notification failed");
            }
        }

        Ok(RunSummary {
            run_id,
            date,
            started_at,
            finished_at,
            meta_rows_appended: meta_appended.len(),
            ringba_rows_appended: ringba_appended.len(),
        })
    }

    /// One concurrent fetch task per individual account across all groups.
    /// Results are stitched back together in spawn order; a failed task
    /// contributes nothing.
    async fn fetch_all_meta(&self, date: NaiveDate) -> Vec<InsightRecord> {
        let label_groups: Vec<AccountGroup> =
            self.groups.iter().map(|g| g.group.clone()).collect();

        let mut tasks = JoinSet::new();
        let mut task_index = 0usize;
        for fetch_group in &self.groups {
            let Some(token) = fetch_group.access_token.clone() else {
                continue;
            };
            for account in &fetch_group.group.accounts {
                let ads = Arc::clone(&self.ads);
                let groups = label_groups.clone();
                let token = token.clone();
                let account = account.clone();
                let index = task_index;
                task_index += 1;
                tasks.spawn(async move {
                    let accounts = vec![account.clone()];
                    let result = ads
                        .fetch_insights(date, date, &token, &accounts, &groups)
                        .await;
                    (index, account, result)
                });
            }
        }

        let mut slots: Vec<(usize, Vec<InsightRecord>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _account, Ok(records))) => slots.push((index, records)),
                Ok((index, account, Err(err))) => {
                    warn!(account = %account, error = %err, "ad account fetch failed");
                    slots.push((index, Vec::new()));
                }
                Err(err) => warn!(error = %err, "ads fetch task aborted"),
            }
        }
        slots.sort_by_key(|(index, _)| *index);
        slots.into_iter().flat_map(|(_, records)| records).collect()
    }

    async fn run_ringba_branch(&self, date: NaiveDate) -> Vec<Vec<String>> {
        let report = match self.calls.fetch_day(date).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "ringba fetch failed");
                self.progress.on_status("Ringba API request unsuccessful.");
                return Vec::new();
            }
        };
        if !report.is_successful {
            self.progress.on_status("Ringba API request unsuccessful.");
            return Vec::new();
        }
        if report.records.is_empty() {
            warn!("no ringba records to save");
            self.progress.on_status("Failed to save Ringba CSV.");
            return Vec::new();
        }

        let rows: Vec<NormalizedRow> = report
            .records
            .iter()
            .map(|record| normalize_ringba_record(record, date))
            .collect();
        match self
            .ringba_staging
            .write_rows(RINGBA_STAGING_FILE, &RINGBA_SCHEMA, &rows)
        {
            Ok(path) => {
                let appended =
                    sync_staged(&path, &self.config.ringba_range, self.sheets.as_ref()).await;
                self.progress
                    .on_status(&format!("Ringba insights saved to {}.", path.display()));
                appended
            }
            Err(err) => {
                warn!(error = %err, "ringba staging write failed");
                self.progress.on_status("Failed to save Ringba CSV.");
                Vec::new()
            }
        }
    }
}

/// Optional cron trigger running the report for the current date, for
/// unattended deployments with a provisioned (refreshable) credential.
pub async fn maybe_build_scheduler(pipeline: Arc<ReportPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.report_cron.clone();
    let job_pipeline = Arc::clone(&pipeline);
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&job_pipeline);
        Box::pin(async move {
            let today = Local::now().date_naive();
            if let Err(err) = pipeline.run_for_date(today, "scheduler").await {
                warn!(error = %err, "scheduled report run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_yaml_parses_groups_in_order() {
        let text = r#"
groups:
  - label: BM1
    token_env: LI1_TOKEN
    accounts: ["act_101", "act_102"]
  - label: BM3
    token_env: LI3_TOKEN
    accounts: ["act_301"]
  - label: BM4
    token_env: LI4_TOKEN
"#;
        let registry: AccountRegistry = serde_yaml::from_str(text).expect("parse");
        assert_eq!(registry.groups.len(), 3);
        assert_eq!(registry.groups[0].label, "BM1");
        assert_eq!(registry.groups[0].accounts.len(), 2);
        assert_eq!(registry.groups[1].token_env, "LI3_TOKEN");
        assert!(registry.groups[2].accounts.is_empty());
    }

    #[test]
    fn notify_id_parsing_trims_and_drops_empties() {
        std::env::set_var("REPORT_NOTIFY_USER_IDS", " 1 ,2,, 3");
        let config = ReportConfig::from_env();
        std::env::remove_var("REPORT_NOTIFY_USER_IDS");
        assert_eq!(config.notify_user_ids, vec!["1", "2", "3"]);
    }
}
