//! Hierarchical crawl over a resolved [`WorkTree`].
//!
//! The crawl runs in two phases. Planning walks servers and projects,
//! listing the levels the tree marks for discovery (each at most once), and
//! produces one job per repository. The jobs then run on a bounded pool; inside a job the
//! branches are visited one after the other:
//!
//! 1. resolve the latest commit (provenance for the file listing),
//! 2. accumulate the branch history into the repository's commit set,
//! 3. accumulate the recursive file tree,
//! 4. cross-reference the repository's tags against the branch history.
//!
//! A failure is recorded against the smallest node it affects and never
//! stops sibling branches or repositories.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::api::{names, ApiDiscovery, SourceApi};
use crate::config::HarvestOptions;
use crate::error::{FailureKind, HarvesterError};
use crate::http::Transport;
use crate::pagination::{Accumulated, Deduplicator};
use crate::report::{CrawlReport, NodeOutcome, NodeStatus, RepositoryReport};
use crate::stats::HarvestStats;
use crate::types::{short_ref_name, str_field, NodePath, Record, RecordKind, WorkTree};
use crate::worklist::{resolve, RejectedRow, WorkRow};

/// Field added to commits and tags listing the branches they were seen on.
const BRANCHES_FIELD: &str = "branches";

/// Runs one crawl. Create a new crawler per run.
pub struct Crawler {
    transport: Arc<dyn Transport>,
    options: HarvestOptions,
    stats: Arc<HarvestStats>,
    cancel: CancellationToken,
}

impl Crawler {
    pub fn new(transport: Arc<dyn Transport>, options: HarvestOptions) -> Self {
        Self {
            transport,
            options,
            stats: Arc::new(HarvestStats::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Share counters with other components of the same run (e.g. the
    /// resolver's discovery calls).
    pub fn with_stats(mut self, stats: Arc<HarvestStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stats(&self) -> &Arc<HarvestStats> {
        &self.stats
    }

    /// Visit every leaf of `tree` once and assemble the report.
    pub async fn run(&self, tree: &WorkTree) -> CrawlReport {
        let started_at = Utc::now();
        let mut outcomes = Vec::new();
        let jobs = self.plan_jobs(tree, &mut outcomes).await;

        tracing::info!(
            repositories = jobs.len(),
            concurrency = self.options.concurrency,
            "Starting crawl"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut set = JoinSet::new();
        let mut paths = HashMap::new();
        for job in jobs {
            let path = job.path();
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let span = tracing::info_span!(
                "repository",
                server = %job.server,
                project = %job.project,
                repository = %job.repository,
            );
            let handle = set.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return job.cancelled();
                    };
                    if cancel.is_cancelled() {
                        return job.cancelled();
                    }
                    harvest_repository(&job, &cancel).await
                }
                .instrument(span),
            );
            paths.insert(handle.id(), path);
        }

        let mut repositories = Vec::new();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    paths.remove(&id);
                    repositories.extend(result.report);
                    outcomes.extend(result.outcomes);
                }
                Err(err) => {
                    tracing::error!(error = %err, "Repository task did not finish");
                    match paths.remove(&err.id()) {
                        Some(path) => {
                            let failure = HarvesterError::Task(path.to_string(), err.to_string());
                            outcomes.push(NodeOutcome::failed(path, &failure));
                        }
                        None => self.stats.record_failure(),
                    }
                }
            }
        }

        repositories.sort_by(|a, b| a.path().cmp(&b.path()));
        outcomes.sort_by(|a, b| a.path.cmp(&b.path));
        for outcome in outcomes.iter().filter(|o| !o.is_completed()) {
            tracing::warn!(
                node = %outcome.path,
                status = %outcome.status,
                message = outcome.message.as_deref().unwrap_or_default(),
                "Node did not complete"
            );
            self.stats.record_failure();
        }

        let report = CrawlReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            cancelled: self.cancel.is_cancelled(),
            repositories,
            outcomes,
            stats: self.stats.snapshot(),
        };
        tracing::info!(
            run_id = %report.run_id,
            repositories = report.repositories.len(),
            incomplete = report.incomplete().count(),
            "Crawl finished"
        );
        report
    }

    /// Expand servers and projects into repository jobs.
    async fn plan_jobs(
        &self,
        tree: &WorkTree,
        outcomes: &mut Vec<NodeOutcome>,
    ) -> Vec<RepositoryJob> {
        let mut jobs = Vec::new();

        for (base_url, server) in &tree.servers {
            let server_path = NodePath::server(base_url);
            if self.cancel.is_cancelled() {
                outcomes.push(cancelled(server_path));
                continue;
            }

            let api = match SourceApi::new(
                &server.endpoint,
                Arc::clone(&self.transport),
                &self.options,
                Arc::clone(&self.stats),
            ) {
                Ok(api) => Arc::new(api),
                Err(err) => {
                    tracing::error!(server = %base_url, error = %err, "Cannot address server");
                    outcomes.push(NodeOutcome::failed(server_path, &err));
                    continue;
                }
            };
            let collection = server.endpoint.collection_name().to_string();

            let mut projects = server.projects.clone();
            if server.discover_projects {
                let listing = api.list_projects(&self.cancel).await;
                match discovered_names(listing, &server_path, outcomes) {
                    Some(found) => {
                        for name in found {
                            projects.entry(name).or_default().discover_repositories = true;
                        }
                    }
                    None if projects.is_empty() => continue,
                    None => {}
                }
            }

            for (project, node) in projects {
                let project_path = NodePath::project(base_url, &project);
                let mut repositories = node.repositories;
                if node.discover_repositories {
                    if self.cancel.is_cancelled() {
                        outcomes.push(cancelled(project_path));
                        continue;
                    }
                    let listing = api.list_repositories(&project, &self.cancel).await;
                    match discovered_names(listing, &project_path, outcomes) {
                        Some(found) => {
                            for name in found {
                                repositories.insert(name, BTreeSet::new());
                            }
                        }
                        None if repositories.is_empty() => continue,
                        None => {}
                    }
                }

                for (repository, branches) in repositories {
                    jobs.push(RepositoryJob {
                        api: Arc::clone(&api),
                        server: base_url.clone(),
                        collection: collection.clone(),
                        project: project.clone(),
                        repository,
                        branches,
                    });
                }
            }
        }

        jobs
    }
}

/// Result of [`harvest_work_list`].
#[derive(Debug)]
pub struct Harvest {
    /// Work-list rows that failed validation.
    pub rejected: Vec<RejectedRow>,
    /// Crawl report, including nodes that could not be resolved.
    pub report: CrawlReport,
}

/// Resolve `rows` against the live API and crawl the resulting tree.
pub async fn harvest_work_list(
    rows: &[WorkRow],
    transport: Arc<dyn Transport>,
    options: HarvestOptions,
    cancel: CancellationToken,
) -> Harvest {
    let stats = Arc::new(HarvestStats::default());
    let discovery = ApiDiscovery::new(Arc::clone(&transport), options.clone(), Arc::clone(&stats))
        .with_cancellation(cancel.clone());
    let resolution = resolve(rows, &discovery).await;
    for _ in &resolution.failures {
        stats.record_failure();
    }

    let mut report = Crawler::new(transport, options)
        .with_stats(stats)
        .with_cancellation(cancel)
        .run(&resolution.tree)
        .await;
    report.add_outcomes(resolution.failures);

    Harvest {
        rejected: resolution.rejected,
        report,
    }
}

struct RepositoryJob {
    api: Arc<SourceApi>,
    server: String,
    collection: String,
    project: String,
    repository: String,
    /// Empty: discover at crawl time.
    branches: BTreeSet<String>,
}

impl RepositoryJob {
    fn path(&self) -> NodePath {
        NodePath::repository(&self.server, &self.project, &self.repository)
    }

    fn branch_path(&self, branch: &str) -> NodePath {
        NodePath::branch(&self.server, &self.project, &self.repository, branch)
    }

    fn cancelled(&self) -> JobResult {
        JobResult {
            report: None,
            outcomes: vec![cancelled(self.path())],
        }
    }
}

struct JobResult {
    report: Option<RepositoryReport>,
    outcomes: Vec<NodeOutcome>,
}

fn cancelled(path: NodePath) -> NodeOutcome {
    let err = HarvesterError::Cancelled(path.to_string());
    NodeOutcome::failed(path, &err)
}

/// Names from a discovery listing. `None` when the listing failed, in which
/// case the failure is recorded against `path`.
fn discovered_names(
    listing: Accumulated,
    path: &NodePath,
    outcomes: &mut Vec<NodeOutcome>,
) -> Option<Vec<String>> {
    if let Some(anomaly) = &listing.anomaly {
        outcomes.push(NodeOutcome::partial(
            path.clone(),
            FailureKind::PaginationAnomaly,
            format!(
                "discovery stopped: continuation token '{}' repeated {} times",
                anomaly.token, anomaly.repeats
            ),
        ));
    }
    match listing.into_result() {
        Ok(records) => Some(names(&records)),
        Err(err) => {
            tracing::error!(node = %path, error = %err, "Discovery failed");
            outcomes.push(NodeOutcome::failed(path.clone(), &err));
            None
        }
    }
}

/// Something that went wrong while harvesting a node.
struct Issue {
    kind: FailureKind,
    message: String,
}

/// Record why `listing` is incomplete, if it is.
fn note_listing(what: &str, listing: &Accumulated, issues: &mut Vec<Issue>) {
    let issue = if let Some(err) = &listing.failure {
        Issue {
            kind: err.kind(),
            message: format!("{what}: {err}"),
        }
    } else if let Some(anomaly) = &listing.anomaly {
        Issue {
            kind: FailureKind::PaginationAnomaly,
            message: format!(
                "{what}: continuation token '{}' repeated {} times",
                anomaly.token, anomaly.repeats
            ),
        }
    } else if listing.truncated {
        Issue {
            kind: FailureKind::NotFound,
            message: format!("{what}: listing disappeared after {} pages", listing.pages),
        }
    } else if listing.not_found {
        Issue {
            kind: FailureKind::NotFound,
            message: format!("{what}: not found"),
        }
    } else {
        return;
    };
    issues.push(issue);
}

fn note_error(what: &str, err: &HarvesterError, issues: &mut Vec<Issue>) {
    issues.push(Issue {
        kind: err.kind(),
        message: format!("{what}: {err}"),
    });
}

fn outcome(path: NodePath, issues: Vec<Issue>, failed: bool) -> NodeOutcome {
    let Some(first) = issues.first() else {
        return NodeOutcome::completed(path);
    };
    let kind = first.kind;
    let message = issues
        .into_iter()
        .map(|i| i.message)
        .collect::<Vec<_>>()
        .join("; ");
    NodeOutcome {
        path,
        status: if failed {
            NodeStatus::Failed
        } else {
            NodeStatus::Partial
        },
        kind: Some(kind),
        message: Some(message),
    }
}

/// Add `branch` to the record's branch list unless already present.
fn add_branch(record: &mut Record, branch: &str) {
    let entry = record
        .entry(BRANCHES_FIELD)
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(branches) = entry {
        if !branches.iter().any(|b| b.as_str() == Some(branch)) {
            branches.push(Value::String(branch.to_string()));
        }
    } else {
        *entry = Value::Array(vec![Value::String(branch.to_string())]);
    }
}

/// Merge one commit of `branch` into the repository-wide commit set.
/// Returns the commit id, if the record has one.
fn merge_commit(commits: &mut Deduplicator, mut record: Record, branch: &str) -> Option<String> {
    let id = RecordKind::Commit.identity(&record);
    match id.as_deref().and_then(|id| commits.position(id)) {
        Some(index) => {
            if let Some(existing) = commits.get_mut(index) {
                add_branch(existing, branch);
            }
        }
        None => {
            add_branch(&mut record, branch);
            commits.push(record);
        }
    }
    id
}

fn commit_date(detail: &Record) -> Option<String> {
    detail
        .get("committer")
        .and_then(|c| c.get("date"))
        .or_else(|| detail.get("author").and_then(|a| a.get("date")))
        .and_then(Value::as_str)
        .map(String::from)
}

fn optional_string(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::String)
}

async fn harvest_repository(job: &RepositoryJob, cancel: &CancellationToken) -> JobResult {
    let repo_path = job.path();
    let mut outcomes = Vec::new();
    let mut issues = Vec::new();

    let branches: Vec<String> = if job.branches.is_empty() {
        let listing = job
            .api
            .list_branches(&job.project, &job.repository, cancel)
            .await;
        if listing.not_found {
            tracing::warn!("Branch listing not found, continuing without branches");
        }
        note_listing("branches", &listing, &mut issues);
        match listing.into_result() {
            Ok(records) => names(&records)
                .iter()
                .map(|name| short_ref_name(name).to_string())
                .collect(),
            Err(err) => {
                tracing::error!(error = %err, "Branch discovery failed");
                outcomes.push(outcome(repo_path, issues, true));
                return JobResult {
                    report: None,
                    outcomes,
                };
            }
        }
    } else {
        job.branches.iter().cloned().collect()
    };

    let mut tags = harvest_tags(job, cancel, &mut issues).await;
    let mut commits = Deduplicator::new(RecordKind::Commit);
    let mut source_tree = Vec::new();
    let mut visited = Vec::new();

    for branch in &branches {
        let path = job.branch_path(branch);
        if cancel.is_cancelled() {
            outcomes.push(cancelled(path));
            continue;
        }
        let branch_outcome = harvest_branch(
            job,
            branch,
            path,
            cancel,
            &mut commits,
            &mut source_tree,
            &mut tags,
        )
        .await;
        outcomes.push(branch_outcome);
        visited.push(branch.clone());
    }

    for tag in &mut tags {
        let harvested = str_field(tag, "commitId").is_some_and(|id| commits.contains(id));
        tag.insert("inHarvestedHistory".to_string(), Value::Bool(harvested));
    }

    outcomes.push(outcome(repo_path, issues, false));
    let complete = outcomes.iter().all(NodeOutcome::is_completed);
    tracing::info!(
        branches = visited.len(),
        commits = commits.len(),
        files = source_tree.len(),
        tags = tags.len(),
        complete,
        "Repository harvested"
    );

    JobResult {
        report: Some(RepositoryReport {
            server: job.server.clone(),
            collection: job.collection.clone(),
            project: job.project.clone(),
            repository: job.repository.clone(),
            branches: visited,
            source_tree,
            commits: commits.into_records(),
            tags,
            complete,
        }),
        outcomes,
    }
}

/// Peeled tag refs of the repository, each resolved to the commit it points
/// at (`commitId`, null when unknown).
async fn harvest_tags(
    job: &RepositoryJob,
    cancel: &CancellationToken,
    issues: &mut Vec<Issue>,
) -> Vec<Record> {
    let listing = job.api.list_tags(&job.project, &job.repository, cancel).await;
    note_listing("tags", &listing, issues);

    let mut tags = listing.records;
    let mut skipped = 0usize;
    for tag in &mut tags {
        let name = str_field(tag, "name").map(|n| short_ref_name(n).to_string());
        let object_id = str_field(tag, "objectId").map(String::from);
        let peeled = str_field(tag, "peeledObjectId").map(String::from);

        // Only annotated tags carry a peeled id; lightweight tags point at
        // the commit directly.
        let commit_id = match (object_id, peeled) {
            (Some(_), Some(peeled)) if cancel.is_cancelled() => {
                skipped += 1;
                Some(peeled)
            }
            (Some(object_id), Some(peeled)) => {
                match job
                    .api
                    .annotated_tag(&job.project, &job.repository, &object_id)
                    .await
                {
                    Ok(Some(detail)) => {
                        for key in ["message", "taggedBy"] {
                            if let Some(value) = detail.get(key) {
                                tag.insert(key.to_string(), value.clone());
                            }
                        }
                        detail
                            .get("taggedObject")
                            .and_then(|o| o.get("objectId"))
                            .and_then(Value::as_str)
                            .map(String::from)
                            .or(Some(peeled))
                    }
                    Ok(None) => Some(peeled),
                    Err(err) => {
                        tracing::warn!(tag = ?name, error = %err, "Annotated tag detail unavailable");
                        note_error("tag detail", &err, issues);
                        Some(peeled)
                    }
                }
            }
            (Some(object_id), None) => Some(object_id),
            (None, _) => None,
        };

        tag.insert("tagName".to_string(), optional_string(name));
        tag.insert("commitId".to_string(), optional_string(commit_id));
        tag.insert(BRANCHES_FIELD.to_string(), Value::Array(Vec::new()));
    }
    if skipped > 0 {
        tracing::info!(skipped, "Cancelled, annotated tag details not fetched");
        issues.push(Issue {
            kind: FailureKind::Cancelled,
            message: format!("tag detail: {skipped} annotated tags skipped after cancellation"),
        });
    }
    tags
}

async fn harvest_branch(
    job: &RepositoryJob,
    branch: &str,
    path: NodePath,
    cancel: &CancellationToken,
    commits: &mut Deduplicator,
    source_tree: &mut Vec<Record>,
    tags: &mut [Record],
) -> NodeOutcome {
    let api = &job.api;
    let (project, repository) = (job.project.as_str(), job.repository.as_str());
    let mut issues = Vec::new();

    let (latest_id, latest_date) = match api.latest_commit_id(project, repository, branch).await {
        Ok(Some(id)) => {
            let date = match api.commit(project, repository, &id).await {
                Ok(detail) => detail.as_ref().and_then(commit_date),
                Err(err) => {
                    note_error("latest commit detail", &err, &mut issues);
                    None
                }
            };
            (Some(id), date)
        }
        Ok(None) => (None, None),
        Err(err) => {
            note_error("latest commit", &err, &mut issues);
            (None, None)
        }
    };

    let listing = api
        .list_commits(project, repository, Some(branch), cancel)
        .await;
    let commits_failed = listing.failure.is_some();
    note_listing("commits", &listing, &mut issues);
    let mut history = HashSet::new();
    for record in listing.records {
        if let Some(id) = merge_commit(commits, record, branch) {
            history.insert(id);
        }
    }

    let listing = api.list_items(project, repository, branch, cancel).await;
    let items_failed = listing.failure.is_some();
    note_listing("items", &listing, &mut issues);
    for mut item in listing.records {
        item.insert("branch".to_string(), Value::String(branch.to_string()));
        item.insert("latestCommitId".to_string(), optional_string(latest_id.clone()));
        item.insert(
            "latestCommitDate".to_string(),
            optional_string(latest_date.clone()),
        );
        source_tree.push(item);
    }

    for tag in tags.iter_mut() {
        if str_field(tag, "commitId").is_some_and(|id| history.contains(id)) {
            add_branch(tag, branch);
        }
    }

    tracing::debug!(branch, commits = history.len(), "Branch harvested");
    outcome(path, issues, commits_failed && items_failed)
}
