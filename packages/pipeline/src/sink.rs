use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use url::Url;
use uuid::Uuid;

use inventory_harvester::report::{CrawlReport, NodeOutcome, ReportSink, RepositoryReport};
use inventory_harvester::stats::StatsSnapshot;

/// Per-repository files, relative to the repository directory.
pub const FILES_FILE: &str = "files.json";
pub const COMMITS_FILE: &str = "commits.json";
pub const TAGS_FILE: &str = "tags.json";
pub const STATUS_FILE: &str = "status.yaml";

/// Run-level files, relative to the output directory.
pub const SUMMARY_FILE: &str = "summary.yaml";
pub const RERUN_FILE: &str = "rerun.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InventoryStatus {
    Complete,
    Partial,
}

/// Status file written alongside the repository inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStatusFile {
    pub server: String,
    pub collection: String,
    pub project: String,
    pub repository: String,
    pub status: InventoryStatus,
    pub last_harvested: String,
    pub branches: Vec<String>,
    pub file_count: usize,
    pub commit_count: usize,
    pub tag_count: usize,
}

/// Summary of a whole run, written once at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummaryFile {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub repositories: usize,
    pub files: usize,
    pub commits: usize,
    pub tags: usize,
    pub completed_nodes: usize,
    pub incomplete: Vec<NodeOutcome>,
    pub stats: StatsSnapshot,
}

impl RunSummaryFile {
    pub fn from_report(report: &CrawlReport) -> Self {
        let sum = |f: fn(&RepositoryReport) -> usize| -> usize {
            report.repositories.iter().map(f).sum()
        };
        Self {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            cancelled: report.cancelled,
            repositories: report.repositories.len(),
            files: sum(|r| r.source_tree.len()),
            commits: sum(|r| r.commits.len()),
            tags: sum(|r| r.tags.len()),
            completed_nodes: report.completed().count(),
            incomplete: report.incomplete().cloned().collect(),
            stats: report.stats,
        }
    }
}

/// Make a server-provided name safe to use as a single path component.
///
/// Separators, characters Windows rejects and `%` itself are percent-escaped,
/// so distinct names never share a directory.
///
/// # Examples
/// ```
/// use inventory_pipeline::sink::path_component;
///
/// assert_eq!(path_component("feature/login"), "feature%2Flogin");
/// assert_ne!(path_component("a/b"), path_component("a_b"));
/// assert_eq!(path_component(".."), "%2E%2E");
/// assert_eq!(path_component("My Project"), "My Project");
/// ```
pub fn path_component(name: &str) -> String {
    if name.is_empty() {
        return "%00".to_string();
    }
    if name.chars().all(|c| c == '.') {
        return "%2E".repeat(name.len());
    }
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                escaped.push_str(&format!("%{:02X}", c as u32));
            }
            c if c.is_control() => escaped.push_str(&format!("%{:02X}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Directory components identifying a server: its host (and port) followed
/// by the path of its base URL, e.g. `tfs.example.com/tfs/Main`.
pub fn server_components(server: &str) -> Vec<String> {
    let Ok(url) = Url::parse(server) else {
        return vec![path_component(server)];
    };
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    std::iter::once(host)
        .chain(
            url.path_segments()
                .into_iter()
                .flatten()
                .filter(|s| !s.is_empty())
                .map(String::from),
        )
        .map(|part| path_component(&part))
        .collect()
}

/// [`ReportSink`] that writes every repository to its own directory:
/// `<output>/<host>/<base path>/<project>/<repository>/`, where the base path
/// ends with the collection.
#[derive(Debug, Clone)]
pub struct FileSink {
    output_dir: PathBuf,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn repository_dir(&self, repository: &RepositoryReport) -> PathBuf {
        let mut dir = self.output_dir.clone();
        dir.extend(server_components(&repository.server));
        dir.join(path_component(&repository.project))
            .join(path_component(&repository.repository))
    }
}

async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> inventory_harvester::Result<()> {
    let yaml = serde_yaml_ng::to_string(value)?;
    tokio::fs::write(path, format!("---\n{yaml}")).await?;
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> inventory_harvester::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[async_trait]
impl ReportSink for FileSink {
    async fn accept(&self, repository: &RepositoryReport) -> inventory_harvester::Result<()> {
        let dir = self.repository_dir(repository);
        tokio::fs::create_dir_all(&dir).await?;

        write_json(&dir.join(FILES_FILE), &repository.source_tree).await?;
        write_json(&dir.join(COMMITS_FILE), &repository.commits).await?;
        write_json(&dir.join(TAGS_FILE), &repository.tags).await?;

        let status = RepositoryStatusFile {
            server: repository.server.clone(),
            collection: repository.collection.clone(),
            project: repository.project.clone(),
            repository: repository.repository.clone(),
            status: if repository.complete {
                InventoryStatus::Complete
            } else {
                InventoryStatus::Partial
            },
            last_harvested: Utc::now().to_rfc3339(),
            branches: repository.branches.clone(),
            file_count: repository.source_tree.len(),
            commit_count: repository.commits.len(),
            tag_count: repository.tags.len(),
        };
        write_yaml(&dir.join(STATUS_FILE), &status).await?;

        tracing::debug!(path = %dir.display(), "wrote repository inventory");
        Ok(())
    }

    async fn finish(&self, report: &CrawlReport) -> inventory_harvester::Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        write_yaml(
            &self.output_dir.join(SUMMARY_FILE),
            &RunSummaryFile::from_report(report),
        )
        .await?;

        let rerun_path = self.output_dir.join(RERUN_FILE);
        let rows = report.rerun_rows();
        if rows.is_empty() {
            // A stale list from an earlier run would point at nodes that are done now
            match tokio::fs::remove_file(&rerun_path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        } else {
            write_yaml(&rerun_path, &rows).await?;
            tracing::info!(
                path = %rerun_path.display(),
                nodes = rows.len(),
                "wrote re-run work list"
            );
        }
        Ok(())
    }
}
