//! Resource keys: URL construction for every endpoint the crawl consumes,
//! and derivation of continuation-token follow-up URLs.
//!
//! Project, repository and branch names are user-controlled and may contain
//! spaces or slashes; they always go through `path_segments_mut` or
//! `query_pairs_mut` so they are escaped.

use url::Url;

use crate::config::CONTINUATION_PARAM;
use crate::error::{HarvesterError, Result};
use crate::types::ServerEndpoint;

/// URL builder for one server's REST API.
#[derive(Debug, Clone)]
pub struct ResourceKeys {
    base: Url,
    api_version: String,
}

impl ResourceKeys {
    /// Parse the server base URL.
    ///
    /// # Errors
    /// Returns `InvalidUrl` when the URL does not parse and `NotABaseUrl`
    /// when it cannot carry path segments.
    pub fn new(server: &ServerEndpoint, api_version: &str) -> Result<Self> {
        let base = Url::parse(&server.base_url).map_err(|source| HarvesterError::InvalidUrl {
            url: server.base_url.clone(),
            source,
        })?;
        if base.cannot_be_a_base() {
            return Err(HarvesterError::NotABaseUrl(server.base_url.clone()));
        }
        Ok(Self {
            base,
            api_version: api_version.to_string(),
        })
    }

    fn build(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("api-version", &self.api_version);
        }
        url
    }

    fn repository_url(
        &self,
        project: &str,
        repository: &str,
        tail: &[&str],
        query: &[(&str, &str)],
    ) -> Url {
        let mut segments = vec![project, "_apis", "git", "repositories", repository];
        segments.extend_from_slice(tail);
        self.build(&segments, query)
    }

    /// List of projects in the collection.
    pub fn projects(&self) -> Url {
        self.build(&["_apis", "projects"], &[])
    }

    /// List of repositories in a project.
    pub fn repositories(&self, project: &str) -> Url {
        self.build(&[project, "_apis", "git", "repositories"], &[])
    }

    /// Branch refs of a repository.
    pub fn branches(&self, project: &str, repository: &str) -> Url {
        self.repository_url(project, repository, &["refs"], &[("filter", "heads/")])
    }

    /// Commits reachable from a branch, or from the default branch when
    /// `branch` is `None`.
    pub fn commits(&self, project: &str, repository: &str, branch: Option<&str>) -> Url {
        match branch {
            Some(branch) => self.repository_url(
                project,
                repository,
                &["commits"],
                &[
                    ("searchCriteria.itemVersion.version", branch),
                    ("searchCriteria.itemVersion.versionType", "branch"),
                ],
            ),
            None => self.repository_url(project, repository, &["commits"], &[]),
        }
    }

    /// Most recent commit of a branch.
    pub fn latest_commit(&self, project: &str, repository: &str, branch: &str) -> Url {
        self.repository_url(
            project,
            repository,
            &["commits"],
            &[
                ("searchCriteria.itemVersion.version", branch),
                ("searchCriteria.itemVersion.versionType", "branch"),
                ("searchCriteria.$top", "1"),
            ],
        )
    }

    /// Full commit detail.
    pub fn commit(&self, project: &str, repository: &str, commit_id: &str) -> Url {
        self.repository_url(project, repository, &["commits", commit_id], &[])
    }

    /// Recursive item (file tree) listing of a branch.
    pub fn items(&self, project: &str, repository: &str, branch: &str) -> Url {
        self.repository_url(
            project,
            repository,
            &["items"],
            &[
                ("scopePath", "/"),
                ("recursionLevel", "Full"),
                ("versionDescriptor.version", branch),
                ("versionDescriptor.versionType", "branch"),
            ],
        )
    }

    /// Tag refs of a repository, peeled so annotated tags expose their commit.
    pub fn tags(&self, project: &str, repository: &str) -> Url {
        self.repository_url(
            project,
            repository,
            &["refs"],
            &[("filter", "tags/"), ("peelTags", "true")],
        )
    }

    /// Annotated tag detail by tag object id.
    pub fn annotated_tag(&self, project: &str, repository: &str, object_id: &str) -> Url {
        self.repository_url(project, repository, &["annotatedtags", object_id], &[])
    }
}

/// Derive the follow-up URL for the next page of a listing.
///
/// Any continuation token already on the URL is replaced, so the token is
/// never sent twice.
///
/// # Examples
/// ```
/// use inventory_harvester::resource::with_continuation;
/// use url::Url;
///
/// let url = Url::parse("https://tfs/Main/_apis/projects?api-version=5.0").unwrap();
/// let next = with_continuation(&url, "abc");
/// assert_eq!(next.as_str(), "https://tfs/Main/_apis/projects?api-version=5.0&continuationToken=abc");
/// ```
#[must_use]
pub fn with_continuation(url: &Url, token: &str) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != CONTINUATION_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut next = url.clone();
    {
        let mut pairs = next.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(CONTINUATION_PARAM, token);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn keys() -> ResourceKeys {
        let server = ServerEndpoint::new("https://tfs.example.com/tfs/Main/", "pat");
        ResourceKeys::new(&server, "5.0").unwrap()
    }

    #[test]
    fn test_projects_url() {
        assert_eq!(
            keys().projects().as_str(),
            "https://tfs.example.com/tfs/Main/_apis/projects?api-version=5.0"
        );
    }

    #[test]
    fn test_names_are_escaped() {
        let url = keys().repositories("My Project");
        assert_eq!(
            url.as_str(),
            "https://tfs.example.com/tfs/Main/My%20Project/_apis/git/repositories?api-version=5.0"
        );

        let url = keys().items("Alpha", "web", "feature/login");
        assert!(url
            .as_str()
            .contains("versionDescriptor.version=feature%2Flogin"));
    }

    #[test]
    fn test_branch_and_tag_filters() {
        let branches = keys().branches("Alpha", "web");
        assert_eq!(
            branches.as_str(),
            "https://tfs.example.com/tfs/Main/Alpha/_apis/git/repositories/web/refs?filter=heads%2F&api-version=5.0"
        );

        let tags = keys().tags("Alpha", "web");
        assert!(tags.as_str().contains("filter=tags%2F"));
        assert!(tags.as_str().contains("peelTags=true"));
    }

    #[test]
    fn test_commit_urls() {
        let latest = keys().latest_commit("Alpha", "web", "main");
        assert!(latest.as_str().contains("searchCriteria.%24top=1"));

        let detail = keys().commit("Alpha", "web", "abc123");
        assert_eq!(detail.path(), "/tfs/Main/Alpha/_apis/git/repositories/web/commits/abc123");

        let all = keys().commits("Alpha", "web", None);
        assert_eq!(all.query(), Some("api-version=5.0"));
    }

    #[test]
    fn test_with_continuation_replaces_previous_token() {
        let url = keys().projects();
        let first = with_continuation(&url, "token-a");
        let second = with_continuation(&first, "token b");
        assert_eq!(
            second.as_str(),
            "https://tfs.example.com/tfs/Main/_apis/projects?api-version=5.0&continuationToken=token+b"
        );
    }

    #[test]
    fn test_invalid_server_url() {
        let server = ServerEndpoint::new("not a url", "pat");
        let err = ResourceKeys::new(&server, "5.0").unwrap_err();
        assert!(matches!(err, HarvesterError::InvalidUrl { .. }));

        let server = ServerEndpoint::new("mailto:someone@example.com", "pat");
        let err = ResourceKeys::new(&server, "5.0").unwrap_err();
        assert!(matches!(err, HarvesterError::NotABaseUrl(_)));
    }
}
