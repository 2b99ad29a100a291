//! Core data types for the harvester.
//!
//! Records coming back from the server are kept loosely typed
//! (`serde_json::Map`); only the handful of fields the crawl itself depends
//! on are read through the accessors here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};

/// Loosely-typed key/value record as returned by the server.
pub type Record = serde_json::Map<String, Value>;

/// One remote server instance (usually a project collection URL).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Collection base URL without trailing slash.
    pub base_url: String,

    /// Personal access token sent as the basic-auth password.
    #[serde(skip_serializing, default)]
    pub credential: String,
}

impl ServerEndpoint {
    pub fn new(base_url: &str, credential: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            credential: credential.into(),
        }
    }

    /// Name of the collection, the last path segment of the base URL.
    ///
    /// # Examples
    /// ```
    /// use inventory_harvester::types::ServerEndpoint;
    ///
    /// let server = ServerEndpoint::new("https://tfs.example.com/tfs/Migration/", "pat");
    /// assert_eq!(server.collection_name(), "Migration");
    /// ```
    #[must_use]
    pub fn collection_name(&self) -> &str {
        let without_scheme = self
            .base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, rest)| rest);
        without_scheme
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(without_scheme)
    }
}

// Hand-written so the credential never ends up in logs.
impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("base_url", &self.base_url)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Trim whitespace and trailing slashes so equal servers merge.
#[must_use]
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Kinds of records the crawl enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
    Project,
    Repository,
    Branch,
    Commit,
    FileItem,
    Tag,
}

impl RecordKind {
    /// Field that uniquely identifies a record of this kind.
    #[must_use]
    pub fn identity_field(&self) -> &'static str {
        match self {
            Self::Project | Self::Repository => "id",
            Self::Branch | Self::Tag => "name",
            Self::Commit => "commitId",
            Self::FileItem => "path",
        }
    }

    /// Identity key of `record`, if it carries one.
    #[must_use]
    pub fn identity(&self, record: &Record) -> Option<String> {
        match record.get(self.identity_field())? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// One HTTP round trip of a paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Record>,
    pub continuation_token: Option<String>,
}

/// String field accessor for records.
#[must_use]
pub fn str_field<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// Strip the `refs/heads/` or `refs/tags/` prefix of a ref name.
///
/// # Examples
/// ```
/// use inventory_harvester::types::short_ref_name;
///
/// assert_eq!(short_ref_name("refs/heads/main"), "main");
/// assert_eq!(short_ref_name("refs/tags/v1.0"), "v1.0");
/// assert_eq!(short_ref_name("develop"), "develop");
/// ```
#[must_use]
pub fn short_ref_name(name: &str) -> &str {
    name.strip_prefix("refs/heads/")
        .or_else(|| name.strip_prefix("refs/tags/"))
        .unwrap_or(name)
}

/// Repositories of one project, each with its branch set.
///
/// An empty branch set means "discover at crawl time". An empty repository
/// map is taken as is unless `discover_repositories` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectNode {
    pub repositories: BTreeMap<String, BTreeSet<String>>,
    /// List the project's repositories at crawl time, in addition to the
    /// entries above.
    pub discover_repositories: bool,
}

impl ProjectNode {
    /// A project whose repositories are listed at crawl time.
    #[must_use]
    pub fn discover() -> Self {
        Self {
            discover_repositories: true,
            ..Self::default()
        }
    }
}

/// Projects of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerNode {
    pub endpoint: ServerEndpoint,
    pub projects: BTreeMap<String, ProjectNode>,
    /// List the server's projects at crawl time, in addition to the entries
    /// above.
    pub discover_projects: bool,
}

impl ServerNode {
    /// A server with exactly `projects`.
    #[must_use]
    pub fn new(endpoint: ServerEndpoint, projects: BTreeMap<String, ProjectNode>) -> Self {
        Self {
            endpoint,
            projects,
            discover_projects: false,
        }
    }

    /// A server whose projects are listed at crawl time.
    #[must_use]
    pub fn discover(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint,
            projects: BTreeMap::new(),
            discover_projects: true,
        }
    }
}

/// Hierarchical enumeration of what to crawl, keyed by normalized base URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkTree {
    pub servers: BTreeMap<String, ServerNode>,
}

impl WorkTree {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Number of repository nodes in the tree.
    #[must_use]
    pub fn repository_count(&self) -> usize {
        self.servers
            .values()
            .flat_map(|s| s.projects.values())
            .map(|p| p.repositories.len())
            .sum()
    }

    /// Number of explicitly listed branches in the tree.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.servers
            .values()
            .flat_map(|s| s.projects.values())
            .flat_map(|p| p.repositories.values())
            .map(BTreeSet::len)
            .sum()
    }
}

/// Address of a node in the work tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePath {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub branch: Option<String>,
}

impl NodePath {
    pub fn server(server: &str) -> Self {
        Self {
            server: server.to_string(),
            project: None,
            repository: None,
            branch: None,
        }
    }

    pub fn project(server: &str, project: &str) -> Self {
        Self {
            project: Some(project.to_string()),
            ..Self::server(server)
        }
    }

    pub fn repository(server: &str, project: &str, repository: &str) -> Self {
        Self {
            repository: Some(repository.to_string()),
            ..Self::project(server, project)
        }
    }

    pub fn branch(server: &str, project: &str, repository: &str, branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
            ..Self::repository(server, project, repository)
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server)?;
        for part in [&self.project, &self.repository, &self.branch]
            .into_iter()
            .flatten()
        {
            write!(f, " / {part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_server_endpoint_normalizes_url() {
        let server = ServerEndpoint::new("  https://tfs.example.com/tfs/Main/ ", "pat");
        assert_eq!(server.base_url, "https://tfs.example.com/tfs/Main");
        assert_eq!(server.collection_name(), "Main");
    }

    #[test]
    fn test_collection_name_of_bare_host() {
        let server = ServerEndpoint::new("https://dev.example.com", "pat");
        assert_eq!(server.collection_name(), "dev.example.com");
    }

    #[test]
    fn test_debug_redacts_credential() {
        let server = ServerEndpoint::new("https://tfs.example.com/tfs/Main", "secret-pat");
        let debug = format!("{server:?}");
        assert!(!debug.contains("secret-pat"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_serialize_skips_credential() {
        let server = ServerEndpoint::new("https://tfs.example.com/tfs/Main", "secret-pat");
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains("secret-pat"));
    }

    #[test]
    fn test_identity_keys() {
        let commit = record(json!({"commitId": "abc123", "comment": "init"}));
        assert_eq!(
            RecordKind::Commit.identity(&commit),
            Some("abc123".to_string())
        );

        let item = record(json!({"path": "/src/main.rs", "objectId": "f00"}));
        assert_eq!(
            RecordKind::FileItem.identity(&item),
            Some("/src/main.rs".to_string())
        );

        let numeric = record(json!({"id": 42}));
        assert_eq!(RecordKind::Project.identity(&numeric), Some("42".to_string()));

        let missing = record(json!({"name": "x"}));
        assert_eq!(RecordKind::Commit.identity(&missing), None);
    }

    #[test]
    fn test_node_path_display() {
        let path = NodePath::branch("https://tfs/Main", "Alpha", "web", "main");
        assert_eq!(path.to_string(), "https://tfs/Main / Alpha / web / main");
        assert_eq!(NodePath::server("https://tfs/Main").to_string(), "https://tfs/Main");
    }

    #[test]
    fn test_work_tree_counts() {
        let mut project = ProjectNode::default();
        project
            .repositories
            .insert("web".to_string(), BTreeSet::from(["main".to_string()]));
        project.repositories.insert("api".to_string(), BTreeSet::new());

        let server = ServerEndpoint::new("https://tfs/Main", "pat");
        let mut tree = WorkTree::default();
        tree.servers.insert(
            server.base_url.clone(),
            ServerNode::new(server, BTreeMap::from([("Alpha".to_string(), project)])),
        );

        assert_eq!(tree.repository_count(), 2);
        assert_eq!(tree.branch_count(), 1);
    }
}
