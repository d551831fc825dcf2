use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use dayrep_adapters::{MetaAdsClient, PollPolicy};
use dayrep_storage::HttpClientConfig;
use dayrep_sync::{
    load_account_registry, maybe_build_scheduler, refresh_account_registry, resolve_group_tokens,
    ProgressHook, ReportConfig, ReportPipeline,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dayrep-cli")]
#[command(about = "Daily Meta + Ringba report sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the report once for one date (defaults to today).
    Run {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Name recorded in the operator notification.
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Stay resident and run the report on the configured cron.
    Schedule,
    /// Rebuild each group's ad-account list from the ads platform and
    /// rewrite the registry file.
    UpdateAccounts,
}

/// Milestone messages go straight to the invoking operator's terminal.
struct StdoutProgress;

impl ProgressHook for StdoutProgress {
    fn on_status(&self, message: &str) {
        println!("{message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ReportConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        date: None,
        user: "cli".to_string(),
    }) {
        Commands::Run { date, user } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let pipeline =
                ReportPipeline::new(config)?.with_progress(Box::new(StdoutProgress));
            let summary = pipeline.run_for_date(date, &user).await?;
            println!(
                "report complete: run_id={} date={} meta_rows={} ringba_rows={}",
                summary.run_id, summary.date, summary.meta_rows_appended,
                summary.ringba_rows_appended,
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(ReportPipeline::new(config)?);
            let scheduler = maybe_build_scheduler(Arc::clone(&pipeline))
                .await?
                .context("scheduler disabled; set DAYREP_SCHEDULER_ENABLED=1")?;
            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::UpdateAccounts => {
            let registry = load_account_registry(&config.accounts_file)?;
            let groups = resolve_group_tokens(registry.groups);
            let ads = MetaAdsClient::from_config(
                &HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                },
                PollPolicy::default(),
            )?;
            let updated = refresh_account_registry(
                &config.accounts_file,
                &groups,
                &ads,
                &config.exclude_account_ids,
            )
            .await?;
            for group in &updated.groups {
                println!("{}: {} accounts retrieved.", group.label, group.accounts.len());
            }
            println!("{} updated.", config.accounts_file.display());
        }
    }

    Ok(())
}
