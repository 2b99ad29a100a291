use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use uuid::Uuid;

use inventory_harvester::error::FailureKind;
use inventory_harvester::report::{deliver, CrawlReport, NodeOutcome, ReportSink, RepositoryReport};
use inventory_harvester::stats::StatsSnapshot;
use inventory_harvester::worklist::WorkRow;
use inventory_harvester::{NodePath, Record};
use inventory_pipeline::sink::{
    FileSink, InventoryStatus, RepositoryStatusFile, RunSummaryFile, COMMITS_FILE, RERUN_FILE,
    SUMMARY_FILE,
};

const SERVER: &str = "https://tfs.example.com/tfs/Main";

fn records(values: Value) -> Vec<Record> {
    values
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
}

fn repository(project: &str, name: &str, complete: bool) -> RepositoryReport {
    RepositoryReport {
        server: SERVER.to_string(),
        collection: "Main".to_string(),
        project: project.to_string(),
        repository: name.to_string(),
        branches: vec!["main".to_string()],
        source_tree: records(json!([{"path": "/"}, {"path": "/README.md", "branch": "main"}])),
        commits: records(json!([{"commitId": "c1", "branches": ["main"]}])),
        tags: Vec::new(),
        complete,
    }
}

fn report(outcomes: Vec<NodeOutcome>) -> CrawlReport {
    CrawlReport {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        cancelled: false,
        repositories: vec![
            repository("Alpha", "web", true),
            repository("Platform Team", "tools/cli", false),
        ],
        outcomes,
        stats: StatsSnapshot::default(),
    }
}

#[tokio::test]
async fn test_file_sink_writes_repository_files() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(dir.path());
    let repo = repository("Alpha", "web", true);

    sink.accept(&repo).await.unwrap();

    let repo_dir = dir
        .path()
        .join("tfs.example.com")
        .join("tfs")
        .join("Main")
        .join("Alpha")
        .join("web");
    assert_eq!(sink.repository_dir(&repo), repo_dir);

    let files: Value =
        serde_json::from_str(&std::fs::read_to_string(repo_dir.join("files.json")).unwrap())
            .unwrap();
    assert_eq!(files[1]["path"], "/README.md");

    let commits: Value =
        serde_json::from_str(&std::fs::read_to_string(repo_dir.join("commits.json")).unwrap())
            .unwrap();
    assert_eq!(commits, json!([{"commitId": "c1", "branches": ["main"]}]));

    let tags = std::fs::read_to_string(repo_dir.join("tags.json")).unwrap();
    assert_eq!(tags, "[]");

    let status_yaml = std::fs::read_to_string(repo_dir.join("status.yaml")).unwrap();
    assert!(status_yaml.starts_with("---\n"));
    let status: RepositoryStatusFile = serde_yaml_ng::from_str(&status_yaml).unwrap();
    assert_eq!(status.status, InventoryStatus::Complete);
    assert_eq!(status.file_count, 2);
    assert_eq!(status.commit_count, 1);
    assert_eq!(status.branches, vec!["main"]);
}

#[tokio::test]
async fn test_unsafe_names_stay_inside_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(dir.path());
    let repo = repository("..", "tools/cli", false);

    sink.accept(&repo).await.unwrap();

    let repo_dir = dir
        .path()
        .join("tfs.example.com")
        .join("tfs")
        .join("Main")
        .join("%2E%2E")
        .join("tools%2Fcli");
    assert!(repo_dir.starts_with(dir.path()));
    let status: RepositoryStatusFile =
        serde_yaml_ng::from_str(&std::fs::read_to_string(repo_dir.join("status.yaml")).unwrap())
            .unwrap();
    assert_eq!(status.status, InventoryStatus::Partial);
    assert_eq!(status.repository, "tools/cli");
}

#[tokio::test]
async fn test_servers_sharing_a_collection_name_stay_apart() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(dir.path());

    let mut first = repository("Alpha", "web", true);
    first.server = "https://tfs-a/tfs/DefaultCollection".to_string();
    first.collection = "DefaultCollection".to_string();
    first.commits = records(json!([{"commitId": "from-a"}]));
    let mut second = first.clone();
    second.server = "https://tfs-b/tfs/DefaultCollection".to_string();
    second.commits = records(json!([{"commitId": "from-b"}]));

    sink.accept(&first).await.unwrap();
    sink.accept(&second).await.unwrap();

    let first_dir = sink.repository_dir(&first);
    assert_ne!(first_dir, sink.repository_dir(&second));
    let commits = std::fs::read_to_string(first_dir.join(COMMITS_FILE)).unwrap();
    assert!(commits.contains("from-a"));
    assert!(!commits.contains("from-b"));
}

#[test]
fn test_similar_names_get_distinct_directories() {
    let sink = FileSink::new("/out");
    let slashed = repository("Alpha", "tools/cli", true);
    let underscored = repository("Alpha", "tools_cli", true);
    assert_ne!(sink.repository_dir(&slashed), sink.repository_dir(&underscored));
}

#[tokio::test]
async fn test_finish_writes_summary_and_rerun_list() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(dir.path());
    let report = report(vec![
        NodeOutcome::completed(NodePath::branch(SERVER, "Alpha", "web", "main")),
        NodeOutcome::partial(
            NodePath::branch(SERVER, "Platform Team", "tools/cli", "main"),
            FailureKind::PaginationAnomaly,
            "items: continuation token 'x' repeated 3 times",
        ),
    ]);

    let rejected = deliver(&report, &sink).await.unwrap();
    assert_eq!(rejected, 0);

    let summary: RunSummaryFile =
        serde_yaml_ng::from_str(&std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap())
            .unwrap();
    assert_eq!(summary.run_id, report.run_id);
    assert_eq!(summary.repositories, 2);
    assert_eq!(summary.files, 4);
    assert_eq!(summary.commits, 2);
    assert_eq!(summary.completed_nodes, 1);
    assert_eq!(summary.incomplete.len(), 1);
    assert_eq!(summary.incomplete[0].kind, Some(FailureKind::PaginationAnomaly));

    let rerun: Vec<WorkRow> =
        serde_yaml_ng::from_str(&std::fs::read_to_string(dir.path().join(RERUN_FILE)).unwrap())
            .unwrap();
    assert_eq!(
        rerun,
        vec![WorkRow {
            server: Some(SERVER.to_string()),
            project: Some("Platform Team".to_string()),
            repository: Some("tools/cli".to_string()),
            branch: Some("main".to_string()),
            credential: None,
        }]
    );
}

#[tokio::test]
async fn test_finish_removes_stale_rerun_list() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(RERUN_FILE), "---\n[]\n").unwrap();
    let sink = FileSink::new(dir.path());

    sink.finish(&report(vec![NodeOutcome::completed(NodePath::repository(
        SERVER, "Alpha", "web",
    ))]))
    .await
    .unwrap();

    assert!(dir.path().join(SUMMARY_FILE).exists());
    assert!(!dir.path().join(RERUN_FILE).exists());
}
