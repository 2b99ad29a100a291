//! Crawl reports and the sink interface they are handed to.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::error::{FailureKind, HarvesterError, Result};
use crate::stats::StatsSnapshot;
use crate::types::{NodePath, Record};
use crate::worklist::WorkRow;

/// Final state of a work-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    /// Usable but possibly incomplete (truncated listing, skipped step).
    Partial,
    Failed,
}

/// Outcome recorded against one work-tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub path: NodePath,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl NodeOutcome {
    pub fn completed(path: NodePath) -> Self {
        Self {
            path,
            status: NodeStatus::Completed,
            kind: None,
            message: None,
        }
    }

    pub fn failed(path: NodePath, error: &HarvesterError) -> Self {
        Self {
            path,
            status: NodeStatus::Failed,
            kind: Some(error.kind()),
            message: Some(error.to_string()),
        }
    }

    pub fn partial(path: NodePath, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            path,
            status: NodeStatus::Partial,
            kind: Some(kind),
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

/// Everything harvested for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryReport {
    /// Server base URL.
    pub server: String,
    pub collection: String,
    pub project: String,
    pub repository: String,
    /// Branches visited, in crawl order.
    pub branches: Vec<String>,
    /// File-tree entries of every visited branch.
    pub source_tree: Vec<Record>,
    /// Commits deduplicated across branches.
    pub commits: Vec<Record>,
    pub tags: Vec<Record>,
    /// Every step of every branch completed.
    pub complete: bool,
}

impl RepositoryReport {
    #[must_use]
    pub fn path(&self) -> NodePath {
        NodePath::repository(&self.server, &self.project, &self.repository)
    }
}

/// Aggregate result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub repositories: Vec<RepositoryReport>,
    /// One entry per visited node, plus failures of nodes that could not be
    /// expanded.
    pub outcomes: Vec<NodeOutcome>,
    pub stats: StatsSnapshot,
}

impl CrawlReport {
    pub fn completed(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.is_completed())
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| !o.is_completed())
    }

    /// Add failures recorded while resolving the work list. A node keeps the
    /// outcome it already has.
    pub fn add_outcomes(&mut self, outcomes: impl IntoIterator<Item = NodeOutcome>) {
        let mut known: BTreeSet<NodePath> = self.outcomes.iter().map(|o| o.path.clone()).collect();
        for outcome in outcomes {
            if known.insert(outcome.path.clone()) {
                self.outcomes.push(outcome);
            } else {
                tracing::debug!(node = %outcome.path, "Node already has an outcome");
            }
        }
        self.outcomes.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// Work-list rows that re-target every node that did not complete.
    ///
    /// Credentials are not part of the report, so the `PAT` column is left
    /// blank for the operator to fill in.
    #[must_use]
    pub fn rerun_rows(&self) -> Vec<WorkRow> {
        let paths: BTreeSet<&NodePath> = self.incomplete().map(|o| &o.path).collect();
        paths
            .into_iter()
            .map(|path| WorkRow {
                server: Some(path.server.clone()),
                project: path.project.clone(),
                credential: None,
                repository: path.repository.clone(),
                branch: path.branch.clone(),
            })
            .collect()
    }
}

/// Consumer of harvested repositories (persistence lives behind this).
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Accept the record sets of one repository.
    async fn accept(&self, repository: &RepositoryReport) -> Result<()>;

    /// Called once after every repository was offered.
    async fn finish(&self, _report: &CrawlReport) -> Result<()> {
        Ok(())
    }
}

/// Hand every repository of `report` to `sink`.
///
/// A failing repository does not stop delivery of the others; the number
/// of rejected repositories is returned.
pub async fn deliver(report: &CrawlReport, sink: &dyn ReportSink) -> Result<usize> {
    let mut rejected = 0;
    for repository in &report.repositories {
        if let Err(err) = sink.accept(repository).await {
            tracing::error!(
                project = %repository.project,
                repository = %repository.repository,
                error = %err,
                "Sink rejected repository"
            );
            rejected += 1;
        }
    }
    sink.finish(report).await?;
    Ok(rejected)
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    repositories: Mutex<Vec<RepositoryReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repositories accepted so far.
    pub fn repositories(&self) -> Vec<RepositoryReport> {
        self.repositories
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn accept(&self, repository: &RepositoryReport) -> Result<()> {
        if let Ok(mut repositories) = self.repositories.lock() {
            repositories.push(repository.clone());
        }
        Ok(())
    }
}
