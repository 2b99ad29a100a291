use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use inventory_harvester::crawl::harvest_work_list;
use inventory_harvester::http::{ReqwestTransport, Transport};
use inventory_harvester::report::deliver;
use inventory_harvester::worklist::load_work_list;

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::sink::{FileSink, RunSummaryFile};

/// Run the harvest worker over the configured work list.
///
/// Supports graceful shutdown via SIGTERM and SIGINT (ctrl+c). Shutdown is
/// cooperative: in-flight requests run to completion, unvisited nodes are
/// recorded as cancelled and everything harvested so far is still written.
pub async fn run_harvest_worker(config: WorkerConfig) -> Result<RunSummaryFile> {
    let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
    let cancel = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        PipelineError::Worker(format!("failed to register SIGTERM handler: {e}"))
    })?;

    let watcher = cancel.clone();
    let signals = tokio::spawn(async move {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, stopping harvest");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, stopping harvest");
            }
        }
        watcher.cancel();
    });

    let result = run_harvest(&config, transport, cancel).await;
    signals.abort();
    result
}

/// Resolve, crawl and write one work list.
///
/// Returns the run summary that was written to `summary.yaml`.
pub async fn run_harvest(
    config: &WorkerConfig,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) -> Result<RunSummaryFile> {
    let path = config.worklist.clone();
    let rows = tokio::task::spawn_blocking(move || load_work_list(&path)).await??;

    tracing::info!(
        worklist = %config.worklist.display(),
        output_dir = %config.output_dir.display(),
        rows = rows.len(),
        concurrency = config.concurrency,
        "starting harvest"
    );

    let harvest = harvest_work_list(&rows, transport, config.harvest_options(), cancel).await;
    let report = harvest.report;

    let sink = FileSink::new(&config.output_dir);
    let rejected = deliver(&report, &sink).await?;
    if rejected > 0 {
        return Err(PipelineError::SinkRejected {
            rejected,
            total: report.repositories.len(),
        });
    }

    let summary = RunSummaryFile::from_report(&report);
    tracing::info!(
        run_id = %summary.run_id,
        repositories = summary.repositories,
        commits = summary.commits,
        incomplete = summary.incomplete.len(),
        rejected_rows = harvest.rejected.len(),
        cancelled = summary.cancelled,
        "harvest finished"
    );

    Ok(summary)
}
