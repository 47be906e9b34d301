use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use snapshoterc::control::ControlListener;
use snapshoterc::env::Environment;
use snapshoterc::error::ErrorKind;
use snapshoterc::procs::{Leader, Logger, RestartLimits, Supervisor, WorkerState};
use snapshoterc::session::{RestartPolicy, SessionName, SessionSpec};

const TIMEOUT: Duration = Duration::from_secs(10);

fn sh(name: &str, script: &str, restart: RestartPolicy) -> SessionSpec {
    SessionSpec::from_command(
        name,
        &["sh".to_string(), "-c".to_string(), script.to_string()],
    )
    .unwrap()
    .with_restart(restart)
}

fn fast_limits(max_restarts: u32) -> RestartLimits {
    RestartLimits {
        max_restarts,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        reset_after: Duration::from_secs(60),
        stop_timeout: Duration::from_secs(2),
    }
}

async fn start(sessions: Vec<SessionSpec>, limits: RestartLimits, dir: &Path) -> Supervisor {
    Supervisor::start(
        sessions,
        Environment::default(),
        dir.to_path_buf(),
        limits,
        None,
    )
    .await
    .unwrap()
}

async fn wait_for<F>(supervisor: &Supervisor, name: &str, pred: F) -> WorkerState
where
    F: Fn(&WorkerState) -> bool,
{
    tokio::time::timeout(TIMEOUT, supervisor.wait_for(name, pred))
        .await
        .expect("timed out waiting for worker state")
        .unwrap()
        .state
}

#[tokio::test]
async fn test_failing_worker_is_restarted_until_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = start(
        vec![sh("crashy", "exit 3", RestartPolicy::OnFailure)],
        fast_limits(2),
        dir.path(),
    )
    .await;

    let state = wait_for(&supervisor, "crashy", |s| {
        matches!(s, WorkerState::Failed { .. })
    })
    .await;
    assert_eq!(
        state,
        WorkerState::Failed {
            reason: "maximum restarts (2) exceeded".to_string()
        }
    );
    assert_eq!(supervisor.worker_status("crashy").unwrap().restarts, 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_clean_exit_is_not_restarted_on_failure_policy() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = start(
        vec![sh("oneshot", "exit 0", RestartPolicy::OnFailure)],
        fast_limits(5),
        dir.path(),
    )
    .await;

    let state = wait_for(&supervisor, "oneshot", |s| {
        matches!(s, WorkerState::Exited { .. })
    })
    .await;
    assert_eq!(
        state,
        WorkerState::Exited {
            code: Some(0),
            signal: None
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = supervisor.worker_status("oneshot").unwrap();
    assert_eq!(status.restarts, 0);
    assert_eq!(status.state, state);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_always_policy_restarts_clean_exits() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = start(
        vec![sh("looping", "exit 0", RestartPolicy::Always)],
        fast_limits(3),
        dir.path(),
    )
    .await;

    wait_for(&supervisor, "looping", |s| {
        matches!(s, WorkerState::Failed { .. })
    })
    .await;
    assert_eq!(supervisor.worker_status("looping").unwrap().restarts, 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_start_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = start(
        vec![
            sh("sleeper", "exec sleep 30", RestartPolicy::OnFailure),
            sh("other", "exec sleep 30", RestartPolicy::OnFailure),
        ],
        fast_limits(5),
        dir.path(),
    )
    .await;

    let first = wait_for(&supervisor, "sleeper", WorkerState::is_running)
        .await
        .pid()
        .unwrap();
    wait_for(&supervisor, "other", WorkerState::is_running).await;

    supervisor.stop_session("sleeper").await.unwrap();
    assert_eq!(
        supervisor.worker_status("sleeper").unwrap().state,
        WorkerState::Stopped
    );
    // a stopped worker is not restarted
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        supervisor.worker_status("sleeper").unwrap().state,
        WorkerState::Stopped
    );
    assert!(supervisor.worker_status("other").unwrap().state.is_running());

    supervisor.start_session("sleeper").await.unwrap();
    let second = wait_for(&supervisor, "sleeper", WorkerState::is_running)
        .await
        .pid()
        .unwrap();
    assert_ne!(first, second);

    supervisor.restart_session("sleeper").await.unwrap();
    let third = wait_for(&supervisor, "sleeper", |s| {
        s.pid().map_or(false, |pid| pid != second)
    })
    .await
    .pid()
    .unwrap();
    assert_ne!(second, third);
    assert_eq!(supervisor.worker_status("sleeper").unwrap().restarts, 0);

    let names: Vec<_> = supervisor.status().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["sleeper", "other"]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = start(
        vec![sh("sleeper", "exec sleep 30", RestartPolicy::Never)],
        fast_limits(0),
        dir.path(),
    )
    .await;

    let err = supervisor.stop_session("nope").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnknownSession(name) if name == "nope"));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SessionSpec::from_command("missing", &["/nonexistent/worker".to_string()])
        .unwrap()
        .with_restart(RestartPolicy::Never);
    let supervisor = start(vec![spec], fast_limits(0), dir.path()).await;

    let state = wait_for(&supervisor, "missing", |s| {
        matches!(s, WorkerState::Failed { .. })
    })
    .await;
    match state {
        WorkerState::Failed { reason } => assert!(reason.contains("missing"), "{}", reason),
        other => panic!("unexpected state: {:?}", other),
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_worker_env_and_output() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");
    let env = Environment::parse("export GREETING=hello\n", &HashMap::new()).unwrap();

    let supervisor = Supervisor::start(
        vec![sh(
            "greeter",
            "echo \"$GREETING from $(pwd -P)\"; echo oops >&2",
            RestartPolicy::Never,
        )],
        env,
        dir.path().to_path_buf(),
        fast_limits(0),
        Some(log_dir.clone()),
    )
    .await
    .unwrap();

    wait_for(&supervisor, "greeter", |s| {
        matches!(s, WorkerState::Exited { .. })
    })
    .await;

    let log_file = Logger::log_path(&log_dir, &SessionName::new("greeter").unwrap());
    let expected = format!(
        "[stdout] hello from {}",
        dir.path().canonicalize().unwrap().display()
    );

    let mut contents = String::new();
    for _ in 0..100 {
        contents = std::fs::read_to_string(&log_file).unwrap_or_default();
        if contents.contains(&expected) && contents.contains("[stderr] oops") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(contents.contains(&expected), "{}", contents);
    assert!(contents.contains("[stderr] oops"), "{}", contents);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_control_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");

    let listener = ControlListener::bind(&socket).await.unwrap();
    let supervisor = start(
        vec![sh("sleeper", "exec sleep 30", RestartPolicy::OnFailure)],
        fast_limits(5),
        dir.path(),
    )
    .await;
    let server = tokio::spawn(supervisor.serve(listener));

    let leader = Leader::new(&socket);
    let mut running = false;
    for _ in 0..200 {
        let status = leader.status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "sleeper");
        if status[0].state.is_running() {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(running);

    leader.stop("sleeper").await.unwrap();
    assert_eq!(leader.status().await.unwrap()[0].state, WorkerState::Stopped);

    let err = leader.restart("nope").await.unwrap_err();
    assert!(err.to_string().contains("no such session: nope"), "{}", err);

    leader.shutdown().await.unwrap();
    tokio::time::timeout(TIMEOUT, server)
        .await
        .expect("supervisor did not exit")
        .unwrap()
        .unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_long_lived_worker_keeps_its_restart_budget() {
    let dir = tempfile::tempdir().unwrap();
    let limits = RestartLimits {
        reset_after: Duration::from_millis(100),
        ..fast_limits(2)
    };
    let supervisor = start(
        vec![sh("stable", "sleep 0.3; exit 1", RestartPolicy::OnFailure)],
        limits,
        dir.path(),
    )
    .await;

    // each run outlives reset_after, so crashes never add up to the limit
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1800);
    while tokio::time::Instant::now() < deadline {
        let status = supervisor.worker_status("stable").unwrap();
        assert!(
            !matches!(status.state, WorkerState::Failed { .. }),
            "{:?}",
            status
        );
        assert!(status.restarts <= 1, "{:?}", status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_idle_client_does_not_block_control_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");

    let listener = ControlListener::bind(&socket).await.unwrap();
    let supervisor = start(
        vec![sh("sleeper", "exec sleep 30", RestartPolicy::OnFailure)],
        fast_limits(5),
        dir.path(),
    )
    .await;
    let server = tokio::spawn(supervisor.serve(listener));

    // connects but never sends a request
    let _idle = tokio::net::UnixStream::connect(&socket).await.unwrap();

    let leader = Leader::new(&socket);
    let status = tokio::time::timeout(Duration::from_secs(3), leader.status())
        .await
        .expect("status blocked behind an idle client")
        .unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "sleeper");

    tokio::time::timeout(Duration::from_secs(3), leader.shutdown())
        .await
        .expect("shutdown blocked behind an idle client")
        .unwrap();
    tokio::time::timeout(TIMEOUT, server)
        .await
        .expect("supervisor did not exit")
        .unwrap()
        .unwrap();
}
