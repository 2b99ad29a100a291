//! Command-line interface for the harvester.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::api::ApiDiscovery;
use crate::config::{
    HarvestOptions, DEFAULT_API_VERSION, DEFAULT_BACKOFF_BASE_MS, DEFAULT_CONCURRENCY,
    DEFAULT_MAX_RETRIES, HTTP_TIMEOUT_SECS,
};
use crate::crawl::harvest_work_list;
use crate::error::{HarvesterError, Result};
use crate::http::{ReqwestTransport, RetryPolicy};
use crate::report::CrawlReport;
use crate::stats::HarvestStats;
use crate::worklist::{load_work_list, resolve, save_work_list, RejectedRow};

/// Default path of the JSON report written by `crawl`.
pub const DEFAULT_REPORT_FILE: &str = "inventory-report.json";

/// Inventory Harvester - Enumerate projects, repositories, branches, commits,
/// files and tags on a source-control server.
#[derive(Parser)]
#[command(name = "inventory-harvester")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve a work list and print the resulting work tree.
    Resolve {
        /// Work list (.yaml, .yml or .json)
        worklist: PathBuf,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Resolve a work list, crawl it and write a JSON report.
    Crawl {
        /// Work list (.yaml, .yml or .json)
        worklist: PathBuf,

        /// Report file (default: inventory-report.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a work list of the nodes that did not complete
        #[arg(long)]
        rerun: Option<PathBuf>,

        #[command(flatten)]
        tuning: Tuning,
    },
}

/// HTTP and concurrency settings shared by all commands.
#[derive(Args, Debug, Clone)]
pub struct Tuning {
    /// Repositories crawled concurrently
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Retries after the first attempt for transient failures
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Base backoff in milliseconds, doubled per attempt
    #[arg(long, default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    pub backoff_ms: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = HTTP_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// api-version sent with every request
    #[arg(long, default_value = DEFAULT_API_VERSION)]
    pub api_version: String,
}

impl Tuning {
    pub fn options(&self) -> HarvestOptions {
        HarvestOptions::default()
            .with_concurrency(self.concurrency)
            .with_retry(RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.backoff_ms),
            ))
            .with_request_timeout(Duration::from_secs(self.timeout_secs))
            .with_api_version(self.api_version.clone())
    }
}

/// Run the CLI.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Resolve { worklist, tuning } => resolve_command(&worklist, &tuning).await,
        Commands::Crawl {
            worklist,
            output,
            rerun,
            tuning,
        } => crawl_command(&worklist, output.as_deref(), rerun.as_deref(), &tuning).await,
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    #[allow(clippy::expect_used)] // Static template string that is guaranteed to be valid
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("valid template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn print_rejected(rejected: &[RejectedRow]) {
    for row in rejected {
        println!(
            "  {} row {}: {}",
            style("Skipped").yellow().bold(),
            row.row,
            row.reason
        );
    }
}

/// Execute the resolve command.
async fn resolve_command(worklist: &Path, tuning: &Tuning) -> Result<()> {
    let rows = load_work_list(worklist)?;
    println!(
        "{} {} ({} rows)",
        style("Resolving").bold(),
        style(worklist.display()).cyan(),
        rows.len()
    );
    println!();

    let options = tuning.options();
    let transport = Arc::new(ReqwestTransport::new(options.request_timeout)?);
    let discovery = ApiDiscovery::new(transport, options, Arc::new(HarvestStats::default()));

    let pb = spinner("Discovering projects and repositories...");
    let resolution = resolve(&rows, &discovery).await;
    pb.finish_and_clear();

    for (base_url, server) in &resolution.tree.servers {
        println!(
            "{} {}",
            style(base_url).green().bold(),
            style(format!("[{}]", server.endpoint.collection_name())).dim()
        );
        for (project, node) in &server.projects {
            println!("  {}", style(project).cyan());
            for (repository, branches) in &node.repositories {
                let branches = if branches.is_empty() {
                    style("(all branches)".to_string()).dim().to_string()
                } else {
                    branches.iter().cloned().collect::<Vec<_>>().join(", ")
                };
                println!("    {repository}: {branches}");
            }
        }
    }
    println!();
    println!(
        "  Servers: {}  Repositories: {}",
        resolution.tree.servers.len(),
        resolution.tree.repository_count()
    );

    print_rejected(&resolution.rejected);
    for failure in &resolution.failures {
        println!(
            "  {} {}: {}",
            style("Failed").red().bold(),
            failure.path,
            failure.message.as_deref().unwrap_or_default()
        );
    }

    Ok(())
}

/// Execute the crawl command.
async fn crawl_command(
    worklist: &Path,
    output: Option<&Path>,
    rerun: Option<&Path>,
    tuning: &Tuning,
) -> Result<()> {
    let output = output.unwrap_or(Path::new(DEFAULT_REPORT_FILE));
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(HarvesterError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Output directory does not exist: {}", parent.display()),
            )));
        }
    }

    let rows = load_work_list(worklist)?;
    println!(
        "{} {} ({} rows)",
        style("Crawling").bold(),
        style(worklist.display()).cyan(),
        rows.len()
    );
    println!();

    let options = tuning.options();
    let transport = Arc::new(ReqwestTransport::new(options.request_timeout)?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight requests");
            on_interrupt.cancel();
        }
    });

    let pb = spinner("Harvesting...");
    let harvest = harvest_work_list(&rows, transport, options, cancel).await;
    pb.finish_and_clear();

    print_rejected(&harvest.rejected);
    print_summary(&harvest.report);

    let json = serde_json::to_string_pretty(&harvest.report)?;
    std::fs::write(output, json)?;

    println!();
    println!("{} {}", style("Saved to:").green().bold(), output.display());

    if let Some(rerun) = rerun {
        let rows = harvest.report.rerun_rows();
        save_work_list(rerun, &rows)?;
        println!(
            "{} {} ({} rows, PAT left blank)",
            style("Re-run list:").yellow().bold(),
            rerun.display(),
            rows.len()
        );
    }

    Ok(())
}

fn print_summary(report: &CrawlReport) {
    let commits: usize = report.repositories.iter().map(|r| r.commits.len()).sum();
    let files: usize = report.repositories.iter().map(|r| r.source_tree.len()).sum();
    let tags: usize = report.repositories.iter().map(|r| r.tags.len()).sum();

    println!("  Repositories: {}", style(report.repositories.len()).green());
    println!("  Commits: {commits}");
    println!("  Files: {files}");
    println!("  Tags: {tags}");
    println!(
        "  Requests: {} ({} retries)",
        report.stats.requests, report.stats.retries
    );
    if report.cancelled {
        println!("  {}", style("Run was cancelled").yellow().bold());
    }

    let incomplete: Vec<_> = report.incomplete().collect();
    if !incomplete.is_empty() {
        println!(
            "  Incomplete: {}",
            style(incomplete.len()).yellow().bold()
        );
        for outcome in incomplete {
            println!(
                "    {} {} ({})",
                style(outcome.status).yellow(),
                outcome.path,
                outcome.message.as_deref().unwrap_or_default()
            );
        }
    }
}
