#![cfg(unix)]

use std::time::{Duration, Instant};

use std::sync::Arc;

use jobwatch_core::{
    job_hash_for_link, BackoffPolicy, QueryTuple, RunStatus, SourceKind, SourceSpec, WorkerRequest,
    WorkerResponse,
};
use jobwatch_storage::{LifecycleStore, StoreConfig};
use jobwatch_sync::{run_bounded, Orchestrator, OrchestratorSettings, ProcessLauncher, TaskError};

fn command_request(script: &str) -> WorkerRequest {
    let mut source = SourceSpec::new("external", SourceKind::Command);
    source.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    WorkerRequest::for_tuple(&source, &QueryTuple::new("Buyer", "Senior", "Monterrey, Mexico"), 10, 72)
}

fn launcher() -> ProcessLauncher {
    ProcessLauncher::new("/bin/false", Vec::new())
}

#[tokio::test]
async fn hanging_process_is_killed_at_the_deadline() {
    let started = Instant::now();
    let result = run_bounded(&launcher(), &command_request("exec sleep 30"), Duration::from_millis(300)).await;
    assert!(matches!(result, Err(TaskError::TimedOut(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn timeout_also_kills_processes_the_worker_started() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("survivor");
    // The shell stays the direct child; the subshell is a grandchild.
    let script = format!("(sleep 1; echo alive > '{}') & wait; true", marker.display());

    let result = run_bounded(&launcher(), &command_request(&script), Duration::from_millis(300)).await;
    assert!(matches!(result, Err(TaskError::TimedOut(_))), "{result:?}");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "a process started by the worker outlived the timeout");
}

#[tokio::test]
async fn process_reads_request_and_prints_rows() {
    let script = r#"
req=$(cat)
case "$req" in
  *'"query_term":"Buyer Senior"'*) ;;
  *) echo "unexpected request: $req" >&2; exit 3 ;;
esac
echo '[{"job_url":"https://www.linkedin.com/jobs/view/1","title":"Buyer"}]'
"#;
    let response = run_bounded(&launcher(), &command_request(script), Duration::from_secs(10))
        .await
        .unwrap();
    match response {
        WorkerResponse::Rows { rows } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].text("title").as_deref(), Some("Buyer"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn throttled_exit_code_and_crashes_are_distinguished() {
    let throttled = run_bounded(&launcher(), &command_request("exit 75"), Duration::from_secs(10)).await;
    assert!(matches!(throttled, Ok(WorkerResponse::Throttled { .. })), "{throttled:?}");

    let crashed = run_bounded(&launcher(), &command_request("exit 9"), Duration::from_secs(10)).await;
    assert!(matches!(crashed, Err(TaskError::Crashed(_))), "{crashed:?}");

    let tagged = run_bounded(
        &launcher(),
        &command_request(r#"echo '{"outcome":"failed","message":"login wall"}'; exit 1"#),
        Duration::from_secs(10),
    )
    .await;
    assert!(
        matches!(tagged, Ok(WorkerResponse::Failed { ref message }) if message == "login wall"),
        "{tagged:?}"
    );
}

#[tokio::test]
async fn builtin_sources_run_the_configured_program() {
    let launcher = ProcessLauncher::new("sh", vec!["-c".to_string(), "cat > /dev/null; echo '[]'".to_string()]);
    let source = SourceSpec::new("linkedin", SourceKind::LinkedinPublic);
    let request = WorkerRequest::for_tuple(&source, &QueryTuple::new("Buyer", "", "Mexico"), 5, 24);
    let response = run_bounded(&launcher, &request, Duration::from_secs(10)).await.unwrap();
    assert_eq!(response, WorkerResponse::Rows { rows: Vec::new() });
}

fn command_source(name: &str, script: &str) -> SourceSpec {
    let mut source = SourceSpec::new(name, SourceKind::Command);
    source.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    source
}

#[tokio::test]
async fn orchestrator_keeps_rows_when_a_sibling_process_hangs() {
    let dir = tempfile::tempdir().unwrap();
    let store = LifecycleStore::connect(&StoreConfig::new(dir.path().join("jobwatch.db")))
        .await
        .unwrap();
    let link = "https://www.linkedin.com/jobs/view/buyer-senior-7001";
    let rows_script = format!(
        "cat > /dev/null; echo '[{{\"job_url\":\"{link}?trk=x\",\"title\":\"Buyer\",\"company\":\"Acme\"}}]'"
    );

    let settings = OrchestratorSettings {
        tuples: vec![QueryTuple::new("Buyer", "Senior", "Monterrey, Mexico")],
        sources: vec![
            command_source("stuck", "sleep 30; true"),
            command_source("fast", &rows_script),
        ],
        source_timeout: Duration::from_millis(500),
        max_run_duration: Duration::from_secs(600),
        jitter_min: Duration::ZERO,
        jitter_max: Duration::ZERO,
        staleness_window_days: 3,
        results_wanted: 20,
        hours_old: 72,
        max_parallel_sources: 2,
        flush_retries: 1,
        throttle: BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        },
        reports_dir: None,
    };
    let orchestrator = Orchestrator::new(settings, store.clone(), Arc::new(launcher()));

    let started = Instant::now();
    let summary = orchestrator.run_once().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.source_timeouts, 1);
    assert_eq!(summary.source_errors, 0);
    assert_eq!(summary.new_postings, 1);
    let posting = store.get_posting(&job_hash_for_link(link)).await.unwrap().unwrap();
    assert_eq!(posting.site_name, "fast");
    assert_eq!(posting.link, link);
}
