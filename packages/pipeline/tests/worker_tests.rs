use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use inventory_harvester::http::ReqwestTransport;
use inventory_pipeline::config::WorkerConfig;
use inventory_pipeline::error::PipelineError;
use inventory_pipeline::sink::{server_components, RERUN_FILE, SUMMARY_FILE};
use inventory_pipeline::worker::run_harvest;

const REPO: &str = "/Main/Alpha/_apis/git/repositories/web";

fn page(items: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "value": items }))
}

async fn mount_project(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/Main/Alpha/_apis/git/repositories"))
        .respond_with(page(json!([{"id": "r1", "name": "web"}])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{REPO}/refs")))
        .and(query_param("filter", "heads/"))
        .respond_with(page(json!([{"name": "refs/heads/main", "objectId": "c2"}])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{REPO}/refs")))
        .and(query_param("filter", "tags/"))
        .respond_with(page(json!([{"name": "refs/tags/v2", "objectId": "c2"}])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{REPO}/commits")))
        .respond_with(page(json!([{"commitId": "c2"}, {"commitId": "c1"}])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(format!("^{REPO}/items$")))
        .respond_with(page(json!([{"path": "/"}, {"path": "/Cargo.toml"}])))
        .mount(server)
        .await;
}

fn config(dir: &std::path::Path, worklist: &str) -> WorkerConfig {
    let path = dir.join("work.yaml");
    std::fs::write(&path, worklist).unwrap();
    WorkerConfig::new(path, dir.join("out")).with_retries(1, Duration::from_millis(10))
}

fn transport() -> Arc<ReqwestTransport> {
    Arc::new(ReqwestTransport::new(Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_run_harvest_writes_inventory() {
    let server = MockServer::start().await;
    mount_project(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        &format!(
            "- Server URL: {}/Main/\n  Project Name: Alpha\n  PAT: pat\n",
            server.uri()
        ),
    );

    let summary = run_harvest(&config, transport(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.repositories, 1);
    assert_eq!(summary.commits, 2);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.tags, 1);
    assert!(summary.incomplete.is_empty());

    let mut repo_dir = dir.path().join("out");
    repo_dir.extend(server_components(&format!("{}/Main", server.uri())));
    let repo_dir = repo_dir.join("Alpha").join("web");
    for file in ["files.json", "commits.json", "tags.json", "status.yaml"] {
        assert!(repo_dir.join(file).exists(), "{file} missing");
    }
    let tags: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(repo_dir.join("tags.json")).unwrap())
            .unwrap();
    assert_eq!(tags[0]["commitId"], "c2");
    assert_eq!(tags[0]["branches"], json!(["main"]));

    assert!(dir.path().join("out").join(SUMMARY_FILE).exists());
    assert!(!dir.path().join("out").join(RERUN_FILE).exists());
}

#[tokio::test]
async fn test_run_harvest_lists_failed_nodes_for_rerun() {
    let server = MockServer::start().await;
    mount_project(&server).await;
    Mock::given(method("GET"))
        .and(path("/Main/Gamma/_apis/git/repositories"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let base = format!("{}/Main", server.uri());
    let config = config(
        dir.path(),
        &format!(
            "- Server URL: {base}\n  Project Name: Alpha\n  PAT: pat\n\
             - Server URL: {base}\n  Project Name: Gamma\n  PAT: pat\n"
        ),
    );

    let summary = run_harvest(&config, transport(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.repositories, 1);
    assert_eq!(summary.incomplete.len(), 1);
    assert_eq!(summary.stats.retries, 1);

    let rerun = std::fs::read_to_string(dir.path().join("out").join(RERUN_FILE)).unwrap();
    assert!(rerun.contains("Project Name: Gamma"));
    assert!(!rerun.contains("PAT"));
}

#[tokio::test]
async fn test_missing_work_list_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = WorkerConfig::new(dir.path().join("absent.yaml"), dir.path().join("out"));

    let err = run_harvest(&config, transport(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Harvester(_)));
}
