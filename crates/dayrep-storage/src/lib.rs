//! Local staging files + Google/Discord API clients for dayrep.
//!
//! This crate owns every side-effecting surface the report touches: the
//! per-run CSV staging files, the cached Google OAuth credential, the Sheets
//! values API, the Apps Script cleanup function, and Discord direct messages.
//! The orchestrator consumes these through the [`RowSink`], [`CleanupRunner`]
//! and [`Notifier`] seams so tests can substitute in-memory fakes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dayrep_core::{NormalizedRow, RowSchema};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dayrep-storage";

pub const DEFAULT_SHEETS_BASE: &str = "https://sheets.googleapis.com";
pub const DEFAULT_SCRIPT_BASE: &str = "https://script.googleapis.com";
pub const DEFAULT_DISCORD_BASE: &str = "https://discord.com/api/v10";

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

// ---------------------------------------------------------------------------
// Seams consumed by the orchestrator
// ---------------------------------------------------------------------------

/// Destination table: read the full existing content, append a delta.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn existing_rows(&self, range_anchor: &str) -> Result<HashSet<Vec<String>>>;
    async fn append_rows(&self, range_anchor: &str, rows: &[Vec<String>]) -> Result<()>;
}

/// Remote row-deletion precondition for idempotent re-runs.
#[async_trait]
pub trait CleanupRunner: Send + Sync {
    async fn delete_rows_for_date(&self, sheet_name: &str, date: NaiveDate) -> Result<()>;
}

/// Best-effort operator notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn direct_message(&self, user_id: &str, text: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Staging files
// ---------------------------------------------------------------------------

/// Per-run CSV staging under a fixed folder. File names are fixed and
/// overwritten each run; the header row is part of the staged content and
/// flows through the same dedup as data rows.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_rows(
        &self,
        file_name: &str,
        schema: &RowSchema,
        rows: &[NormalizedRow],
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating staging folder {}", self.root.display()))?;
        let path = self.root.join(file_name);

        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("opening staging file {}", path.display()))?;
        writer
            .write_record(schema.columns)
            .context("writing staging header")?;
        for row in rows {
            writer
                .write_record(&row.values)
                .context("writing staging row")?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing staging file {}", path.display()))?;

        info!(file = %path.display(), rows = rows.len(), schema = schema.name, "staged rows");
        Ok(path)
    }

    /// All records in file order, header included.
    pub fn read_rows(path: &Path) -> Result<Vec<Vec<String>>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("opening staging file {}", path.display()))?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("reading {}", path.display()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Google OAuth token cache
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no cached credential at {0}; provision the token file first")]
    MissingToken(PathBuf),
    #[error("cached credential expired and cannot be refreshed non-interactively")]
    NotRefreshable,
    #[error("token refresh rejected: {0}")]
    RefreshRejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// On-disk shape of an authorized-user `token.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CachedToken {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub expiry: Option<String>,
}

impl CachedToken {
    /// Expired means unusable within the next minute. A token without an
    /// expiry stamp is treated as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self
            .expiry
            .as_deref()
            .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
        {
            Some(expiry) => expiry.with_timezone(&Utc) <= now + chrono::Duration::seconds(60),
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
}

/// Lazy acquire-and-cache credential source shared by the Sheets and Script
/// clients. Reads the cached token, refreshes through the token endpoint when
/// expired, and persists the refreshed credential back before use.
#[derive(Debug)]
pub struct GoogleAuth {
    token_path: PathBuf,
    http: reqwest::Client,
}

impl GoogleAuth {
    pub fn new(token_path: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            token_path: token_path.into(),
            http,
        }
    }

    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.load().await?;
        if !cached.is_expired_at(Utc::now()) {
            if let Some(token) = &cached.token {
                return Ok(token.clone());
            }
        }

        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            cached.refresh_token.clone(),
            cached.client_id.clone(),
            cached.client_secret.clone(),
        ) else {
            return Err(AuthError::NotRefreshable);
        };
        let token_uri = cached
            .token_uri
            .clone()
            .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_string());

        let response = self
            .http
            .post(&token_uri)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected(body));
        }
        let refreshed: RefreshResponse = response.json().await?;

        cached.token = Some(refreshed.access_token.clone());
        cached.expiry = Some(
            (Utc::now() + chrono::Duration::seconds(refreshed.expires_in))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        self.persist(&cached).await?;
        Ok(refreshed.access_token)
    }

    async fn load(&self) -> Result<CachedToken, AuthError> {
        if !self.token_path.exists() {
            return Err(AuthError::MissingToken(self.token_path.clone()));
        }
        let text = fs::read_to_string(&self.token_path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn persist(&self, token: &CachedToken) -> Result<(), AuthError> {
        let bytes = serde_json::to_vec_pretty(token)?;
        let temp_path = self
            .token_path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes).await?;
        match fs::rename(&temp_path, &self.token_path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Google Sheets values client
// ---------------------------------------------------------------------------

fn encode_range(range: &str) -> String {
    range.replace(' ', "%20")
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug)]
pub struct SheetsClient {
    http: reqwest::Client,
    auth: Arc<GoogleAuth>,
    base_url: String,
    spreadsheet_id: String,
}

impl SheetsClient {
    pub fn new(
        http: reqwest::Client,
        auth: Arc<GoogleAuth>,
        base_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            auth,
            base_url: base_url.into(),
            spreadsheet_id: spreadsheet_id.into(),
        }
    }
}

#[async_trait]
impl RowSink for SheetsClient {
    /// Existing content spans the full column width from the range anchor
    /// out to column Z.
    async fn existing_rows(&self, range_anchor: &str) -> Result<HashSet<Vec<String>>> {
        let token = self.auth.access_token().await?;
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.base_url,
            self.spreadsheet_id,
            encode_range(&format!("{range_anchor}:Z")),
        );
        let range: ValueRange = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .context("fetching existing sheet values")?
            .error_for_status()
            .context("existing-values request rejected")?
            .json()
            .await
            .context("decoding existing sheet values")?;
        Ok(range.values.into_iter().collect())
    }

    async fn append_rows(&self, range_anchor: &str, rows: &[Vec<String>]) -> Result<()> {
        let token = self.auth.access_token().await?;
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.base_url,
            self.spreadsheet_id,
            encode_range(range_anchor),
        );
        self.http
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "values": rows }))
            .send()
            .await
            .context("appending sheet values")?
            .error_for_status()
            .context("append request rejected")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Apps Script cleanup client
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ScriptClient {
    http: reqwest::Client,
    auth: Arc<GoogleAuth>,
    base_url: String,
    script_id: String,
}

impl ScriptClient {
    pub fn new(
        http: reqwest::Client,
        auth: Arc<GoogleAuth>,
        base_url: impl Into<String>,
        script_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            auth,
            base_url: base_url.into(),
            script_id: script_id.into(),
        }
    }

    async fn run_function(&self, function: &str, parameters: serde_json::Value) -> Result<serde_json::Value> {
        let token = self.auth.access_token().await?;
        let url = format!("{}/v1/scripts/{}:run", self.base_url, self.script_id);
        let body: serde_json::Value = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "function": function, "parameters": parameters }))
            .send()
            .await
            .with_context(|| format!("running apps script function {function}"))?
            .error_for_status()
            .context("apps script request rejected")?
            .json()
            .await
            .context("decoding apps script response")?;
        if let Some(error) = body.get("error") {
            bail!("apps script function {function} failed: {error}");
        }
        Ok(body)
    }
}

#[async_trait]
impl CleanupRunner for ScriptClient {
    async fn delete_rows_for_date(&self, sheet_name: &str, date: NaiveDate) -> Result<()> {
        let day = date.format("%Y-%m-%d").to_string();
        self.run_function("deleteRowsByDate", json!([day, sheet_name]))
            .await?;
        info!(sheet = sheet_name, date = %day, "cleanup script completed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Discord notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DmChannel {
    id: String,
}

#[derive(Debug)]
pub struct DiscordNotifier {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl DiscordNotifier {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        bot_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            bot_token: bot_token.into(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn direct_message(&self, user_id: &str, text: &str) -> Result<()> {
        let auth = format!("Bot {}", self.bot_token);
        let channel: DmChannel = self
            .http
            .post(format!("{}/users/@me/channels", self.base_url))
            .header("Authorization", &auth)
            .json(&json!({ "recipient_id": user_id }))
            .send()
            .await
            .context("opening DM channel")?
            .error_for_status()
            .context("DM channel request rejected")?
            .json()
            .await
            .context("decoding DM channel")?;

        self.http
            .post(format!("{}/channels/{}/messages", self.base_url, channel.id))
            .header("Authorization", &auth)
            .json(&json!({ "content": text }))
            .send()
            .await
            .context("sending DM")?
            .error_for_status()
            .context("DM rejected")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dayrep_core::{InsightRecord, META_SCHEMA};
    use tempfile::tempdir;

    #[test]
    fn staging_round_preserves_header_and_order() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path().join("insights"));
        let rows = vec![
            dayrep_core::normalize_meta_record(
                &InsightRecord::new()
                    .with_field("date_start", "2024-05-01")
                    .with_field("adset_name", "b"),
            ),
            dayrep_core::normalize_meta_record(
                &InsightRecord::new()
                    .with_field("date_start", "2024-05-01")
                    .with_field("adset_name", "a"),
            ),
        ];

        let path = store
            .write_rows("general_report.csv", &META_SCHEMA, &rows)
            .expect("write");
        let read = StagingStore::read_rows(&path).expect("read");

        assert_eq!(read.len(), 3);
        assert_eq!(read[0], META_SCHEMA.columns.to_vec());
        assert_eq!(read[1][4], "b");
        assert_eq!(read[2][4], "a");
    }

    #[test]
    fn overwriting_a_staging_file_replaces_prior_content() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let row = dayrep_core::normalize_meta_record(&InsightRecord::new());

        store
            .write_rows("general_report.csv", &META_SCHEMA, &[row.clone(), row.clone()])
            .expect("first write");
        let path = store
            .write_rows("general_report.csv", &META_SCHEMA, &[row])
            .expect("second write");

        let read = StagingStore::read_rows(&path).expect("read");
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn token_expiry_uses_a_one_minute_margin() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap();
        let mut token = CachedToken {
            token: Some("t".into()),
            expiry: Some("2024-05-01T13:00:00Z".into()),
            ..CachedToken::default()
        };
        assert!(!token.is_expired_at(now));

        token.expiry = Some("2024-05-01T12:00:30Z".into());
        assert!(token.is_expired_at(now));

        token.expiry = None;
        assert!(token.is_expired_at(now));
    }

    #[tokio::test]
    async fn fresh_cached_token_is_returned_without_refresh() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("token.json");
        let expiry = (Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        std::fs::write(
            &path,
            serde_json::to_vec(&CachedToken {
                token: Some("cached-token".into()),
                expiry: Some(expiry),
                ..CachedToken::default()
            })
            .unwrap(),
        )
        .unwrap();

        let auth = GoogleAuth::new(&path, reqwest::Client::new());
        let token = auth.access_token().await.expect("token");
        assert_eq!(token, "cached-token");
    }

    #[tokio::test]
    async fn missing_token_file_is_a_distinct_error() {
        let dir = tempdir().expect("tempdir");
        let auth = GoogleAuth::new(dir.path().join("token.json"), reqwest::Client::new());
        match auth.access_token().await {
            Err(AuthError::MissingToken(_)) => {}
            other => panic!("expected MissingToken, got {other:?}"),
        }
    }

    #[test]
    fn range_encoding_handles_sheet_names_with_spaces() {
        assert_eq!(encode_range("test meta!A1:Z"), "test%20meta!A1:Z");
    }
}
