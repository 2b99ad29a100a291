//! Typed access to the listing and detail endpoints of one server.
//!
//! Every listing goes through the generic [`Paginator`]; this module only
//! decides which URL and which record identity each endpoint uses.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::HarvestOptions;
use crate::error::Result;
use crate::http::{FetchOutcome, FetchRequest, Fetcher, RetryPolicy, Transport};
use crate::pagination::{extract_value_page, Accumulated, Paginator};
use crate::resource::ResourceKeys;
use crate::stats::HarvestStats;
use crate::types::{str_field, Record, RecordKind, ServerEndpoint};
use crate::worklist::Discovery;

/// Endpoint catalogue for one server.
#[derive(Clone)]
pub struct SourceApi {
    keys: ResourceKeys,
    fetcher: Fetcher,
    retry: RetryPolicy,
}

impl SourceApi {
    pub fn new(
        server: &ServerEndpoint,
        transport: Arc<dyn Transport>,
        options: &HarvestOptions,
        stats: Arc<HarvestStats>,
    ) -> Result<Self> {
        Ok(Self {
            keys: ResourceKeys::new(server, &options.api_version)?,
            fetcher: Fetcher::new(transport, server.credential.clone(), stats),
            retry: options.retry.clone(),
        })
    }

    pub fn keys(&self) -> &ResourceKeys {
        &self.keys
    }

    fn request(&self, url: url::Url) -> FetchRequest {
        FetchRequest::get(url, self.retry.clone())
    }

    async fn list(
        &self,
        kind: RecordKind,
        url: url::Url,
        cancel: &CancellationToken,
    ) -> Accumulated {
        Paginator::new(&self.fetcher, kind)
            .with_cancellation(cancel)
            .collect(self.request(url))
            .await
    }

    pub async fn list_projects(&self, cancel: &CancellationToken) -> Accumulated {
        self.list(RecordKind::Project, self.keys.projects(), cancel)
            .await
    }

    pub async fn list_repositories(
        &self,
        project: &str,
        cancel: &CancellationToken,
    ) -> Accumulated {
        self.list(
            RecordKind::Repository,
            self.keys.repositories(project),
            cancel,
        )
        .await
    }

    pub async fn list_branches(
        &self,
        project: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> Accumulated {
        self.list(
            RecordKind::Branch,
            self.keys.branches(project, repository),
            cancel,
        )
        .await
    }

    pub async fn list_commits(
        &self,
        project: &str,
        repository: &str,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> Accumulated {
        self.list(
            RecordKind::Commit,
            self.keys.commits(project, repository, branch),
            cancel,
        )
        .await
    }

    pub async fn list_items(
        &self,
        project: &str,
        repository: &str,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Accumulated {
        self.list(
            RecordKind::FileItem,
            self.keys.items(project, repository, branch),
            cancel,
        )
        .await
    }

    pub async fn list_tags(
        &self,
        project: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> Accumulated {
        self.list(RecordKind::Tag, self.keys.tags(project, repository), cancel)
            .await
    }

    /// Id of the newest commit on `branch`, `None` when the branch is empty
    /// or gone.
    pub async fn latest_commit_id(
        &self,
        project: &str,
        repository: &str,
        branch: &str,
    ) -> Result<Option<String>> {
        // Only the first page matters; the listing is capped at one commit.
        let request = self.request(self.keys.latest_commit(project, repository, branch));
        match self.fetcher.fetch(&request).await? {
            FetchOutcome::NotFound => Ok(None),
            FetchOutcome::Success(response) => {
                let page = extract_value_page(&response, &request.url)?;
                Ok(page
                    .items
                    .first()
                    .and_then(|c| str_field(c, "commitId"))
                    .map(String::from))
            }
        }
    }

    /// Full commit detail; `None` on 404.
    pub async fn commit(
        &self,
        project: &str,
        repository: &str,
        commit_id: &str,
    ) -> Result<Option<Record>> {
        let url = self.keys.commit(project, repository, commit_id);
        self.fetcher.fetch_object(&self.request(url)).await
    }

    /// Annotated tag detail; `None` on 404 (lightweight tags have no tag
    /// object).
    pub async fn annotated_tag(
        &self,
        project: &str,
        repository: &str,
        object_id: &str,
    ) -> Result<Option<Record>> {
        let url = self.keys.annotated_tag(project, repository, object_id);
        self.fetcher.fetch_object(&self.request(url)).await
    }
}

/// Names of the records of a listing, in listing order.
#[must_use]
pub fn names(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| str_field(r, "name"))
        .map(String::from)
        .collect()
}

/// [`Discovery`] over the live HTTP API.
#[derive(Clone)]
pub struct ApiDiscovery {
    transport: Arc<dyn Transport>,
    options: HarvestOptions,
    stats: Arc<HarvestStats>,
    cancel: CancellationToken,
}

impl ApiDiscovery {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: HarvestOptions,
        stats: Arc<HarvestStats>,
    ) -> Self {
        Self {
            transport,
            options,
            stats,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn api(&self, server: &ServerEndpoint) -> Result<SourceApi> {
        SourceApi::new(
            server,
            Arc::clone(&self.transport),
            &self.options,
            Arc::clone(&self.stats),
        )
    }
}

#[async_trait]
impl Discovery for ApiDiscovery {
    async fn projects(&self, server: &ServerEndpoint) -> Result<Vec<String>> {
        let records = self.api(server)?.list_projects(&self.cancel).await.into_result()?;
        Ok(names(&records))
    }

    async fn repositories(&self, server: &ServerEndpoint, project: &str) -> Result<Vec<String>> {
        let records = self
            .api(server)?
            .list_repositories(project, &self.cancel)
            .await
            .into_result()?;
        Ok(names(&records))
    }
}
