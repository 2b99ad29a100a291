//! Work-list resolution.
//!
//! A work list is a sparse table of rows with the columns `Server URL`,
//! `Project Name`, `PAT`, `Repository Name` and `Branch Name`. Blank cells
//! widen the scope of a row:
//!
//! | filled cells                 | expands to                                  |
//! |------------------------------|---------------------------------------------|
//! | server                       | every project, repository and branch        |
//! | server, project              | every repository and branch of the project  |
//! | server, project, repository  | every branch (discovered at crawl time)     |
//! | all four                     | exactly that branch                         |
//!
//! Rows are merged per server. The first credential seen for a server wins;
//! project, repository and branch sets are unioned, and a broader row is
//! never narrowed by a more specific one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HarvesterError, Result};
use crate::report::NodeOutcome;
use crate::types::{normalize_base_url, NodePath, ProjectNode, ServerEndpoint, ServerNode, WorkTree};

/// One row of the work list, exactly as written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRow {
    #[serde(
        rename = "Server URL",
        alias = "server",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server: Option<String>,

    #[serde(
        rename = "Project Name",
        alias = "project",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub project: Option<String>,

    #[serde(
        rename = "PAT",
        alias = "credential",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credential: Option<String>,

    #[serde(
        rename = "Repository Name",
        alias = "repository",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub repository: Option<String>,

    #[serde(
        rename = "Branch Name",
        alias = "branch",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub branch: Option<String>,
}

impl WorkRow {
    pub fn new(server: &str, credential: &str) -> Self {
        Self {
            server: Some(server.to_string()),
            credential: Some(credential.to_string()),
            ..Self::default()
        }
    }

    pub fn project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn repository(mut self, repository: &str) -> Self {
        self.repository = Some(repository.to_string());
        self
    }

    pub fn branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string());
        self
    }
}

/// A blank cell counts as omitted.
fn cell(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Scope of a validated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowScope {
    Server,
    Project(String),
    Repository(String, String),
    Branch(String, String, String),
}

/// A row that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRow {
    pub server: String,
    pub credential: String,
    pub scope: RowScope,
}

/// Validate one row. `index` is 1-based and only used in messages.
///
/// # Errors
/// `InvalidRow` when the server or credential is missing, or when a
/// narrower cell is filled without the broader cell it belongs to.
pub fn validate_row(index: usize, row: &WorkRow) -> Result<ValidRow> {
    let invalid = |reason: &str| HarvesterError::InvalidRow {
        row: index,
        reason: reason.to_string(),
    };

    let server = cell(&row.server).ok_or_else(|| invalid("missing Server URL"))?;
    let credential = cell(&row.credential).ok_or_else(|| invalid("missing PAT"))?;
    if !(server.starts_with("http://") || server.starts_with("https://")) {
        return Err(invalid("Server URL must start with http:// or https://"));
    }

    let scope = match (cell(&row.project), cell(&row.repository), cell(&row.branch)) {
        (None, None, None) => RowScope::Server,
        (Some(p), None, None) => RowScope::Project(p.to_string()),
        (Some(p), Some(r), None) => RowScope::Repository(p.to_string(), r.to_string()),
        (Some(p), Some(r), Some(b)) => {
            RowScope::Branch(p.to_string(), r.to_string(), b.to_string())
        }
        (None, Some(_), _) => return Err(invalid("Repository Name given without Project Name")),
        (_, None, Some(_)) => return Err(invalid("Branch Name given without Repository Name")),
    };

    Ok(ValidRow {
        server: normalize_base_url(server),
        credential: credential.to_string(),
        scope,
    })
}

/// Repository scope before discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryPlan {
    pub all_branches: bool,
    pub branches: BTreeSet<String>,
}

/// Project scope before discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectPlan {
    pub all_repositories: bool,
    pub repositories: BTreeMap<String, RepositoryPlan>,
}

/// Server scope before discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPlan {
    pub endpoint: ServerEndpoint,
    pub all_projects: bool,
    pub projects: BTreeMap<String, ProjectPlan>,
}

/// Rows merged per server, before discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    pub servers: BTreeMap<String, ServerPlan>,
}

/// A row that was rejected during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub row: usize,
    pub reason: String,
}

/// Validate and merge rows. Invalid rows are logged and returned, never
/// fatal.
pub fn plan(rows: &[WorkRow]) -> (WorkPlan, Vec<RejectedRow>) {
    let mut plan = WorkPlan::default();
    let mut rejected = Vec::new();

    for (offset, row) in rows.iter().enumerate() {
        let index = offset + 1;
        let valid = match validate_row(index, row) {
            Ok(valid) => valid,
            Err(err) => {
                tracing::warn!(row = index, error = %err, "Skipping work-list row");
                rejected.push(RejectedRow {
                    row: index,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let server = plan
            .servers
            .entry(valid.server.clone())
            .or_insert_with(|| ServerPlan {
                endpoint: ServerEndpoint::new(&valid.server, valid.credential.clone()),
                all_projects: false,
                projects: BTreeMap::new(),
            });
        if server.endpoint.credential != valid.credential {
            tracing::debug!(
                row = index,
                server = %valid.server,
                "Row credential ignored, first credential for this server wins"
            );
        }

        match valid.scope {
            RowScope::Server => server.all_projects = true,
            RowScope::Project(project) => {
                server.projects.entry(project).or_default().all_repositories = true;
            }
            RowScope::Repository(project, repository) => {
                server
                    .projects
                    .entry(project)
                    .or_default()
                    .repositories
                    .entry(repository)
                    .or_default()
                    .all_branches = true;
            }
            RowScope::Branch(project, repository, branch) => {
                server
                    .projects
                    .entry(project)
                    .or_default()
                    .repositories
                    .entry(repository)
                    .or_default()
                    .branches
                    .insert(branch);
            }
        }
    }

    (plan, rejected)
}

/// Source of project and repository names for omitted cells.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn projects(&self, server: &ServerEndpoint) -> Result<Vec<String>>;

    async fn repositories(&self, server: &ServerEndpoint, project: &str) -> Result<Vec<String>>;
}

/// Outcome of resolving a work list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub tree: WorkTree,
    pub rejected: Vec<RejectedRow>,
    /// Discovery calls that failed; their nodes are missing from the tree.
    pub failures: Vec<NodeOutcome>,
}

/// Expand a work list into a fully enumerated [`WorkTree`].
///
/// Projects and repositories are discovered for omitted cells; branch sets
/// of repositories without an explicit branch stay empty and are
/// discovered at crawl time.
pub async fn resolve(rows: &[WorkRow], discovery: &dyn Discovery) -> Resolution {
    let (plan, rejected) = plan(rows);
    let mut resolution = Resolution {
        rejected,
        ..Resolution::default()
    };

    for (base_url, server_plan) in plan.servers {
        let endpoint = server_plan.endpoint;
        let mut projects = server_plan.projects;

        if server_plan.all_projects {
            match discovery.projects(&endpoint).await {
                Ok(names) => {
                    tracing::info!(server = %base_url, projects = names.len(), "Discovered projects");
                    for name in names {
                        projects.entry(name).or_default().all_repositories = true;
                    }
                }
                Err(err) => {
                    tracing::error!(server = %base_url, error = %err, "Project discovery failed");
                    resolution
                        .failures
                        .push(NodeOutcome::failed(NodePath::server(&base_url), &err));
                    if projects.is_empty() {
                        continue;
                    }
                }
            }
        }

        let mut server_node = ServerNode::new(endpoint.clone(), BTreeMap::new());

        for (project, project_plan) in projects {
            let mut repositories = project_plan.repositories;

            if project_plan.all_repositories {
                match discovery.repositories(&endpoint, &project).await {
                    Ok(names) => {
                        tracing::info!(
                            server = %base_url,
                            project = %project,
                            repositories = names.len(),
                            "Discovered repositories"
                        );
                        for name in names {
                            repositories.entry(name).or_default().all_branches = true;
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            server = %base_url,
                            project = %project,
                            error = %err,
                            "Repository discovery failed"
                        );
                        resolution
                            .failures
                            .push(NodeOutcome::failed(NodePath::project(&base_url, &project), &err));
                        if repositories.is_empty() {
                            continue;
                        }
                    }
                }
            }

            let node = ProjectNode {
                repositories: repositories
                    .into_iter()
                    .map(|(name, repo)| {
                        let branches = if repo.all_branches {
                            BTreeSet::new()
                        } else {
                            repo.branches
                        };
                        (name, branches)
                    })
                    .collect(),
                discover_repositories: false,
            };
            server_node.projects.insert(project, node);
        }

        resolution.tree.servers.insert(base_url, server_node);
    }

    resolution
}

/// Read a work list from a `.yaml`, `.yml` or `.json` file holding a list
/// of rows.
///
/// # Errors
/// IO and parse errors, or `UnsupportedWorkList` for other extensions.
pub fn load_work_list(path: &Path) -> Result<Vec<WorkRow>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let content = std::fs::read_to_string(path)?;
    match extension.as_str() {
        "yaml" | "yml" => Ok(serde_yaml_ng::from_str(&content)?),
        "json" => Ok(serde_json::from_str(&content)?),
        _ => Err(HarvesterError::UnsupportedWorkList(path.display().to_string())),
    }
}

/// Write rows back out (used for re-run lists). Format follows the
/// extension as in [`load_work_list`].
pub fn save_work_list(path: &Path, rows: &[WorkRow]) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let content = match extension.as_str() {
        "yaml" | "yml" => serde_yaml_ng::to_string(rows)?,
        "json" => serde_json::to_string_pretty(rows)?,
        _ => return Err(HarvesterError::UnsupportedWorkList(path.display().to_string())),
    };
    std::fs::write(path, content)?;
    Ok(())
}
