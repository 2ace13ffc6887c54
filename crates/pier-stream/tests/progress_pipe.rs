#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use pier_stream::progress::{
    CommandSpec, InstallPlan, ProgressPipe, ProgressReceiver, ProgressUpdate, StartCommand, Step,
};
use pier_stream::StreamError;
use tokio_util::sync::CancellationToken;

fn sh(script: &str, arg: &Path) -> CommandSpec {
    CommandSpec::new("/bin/sh", ["-c".into(), script.to_string(), "sh".into(), arg.display().to_string()])
}

struct Fixture {
    _dir: tempfile::TempDir,
    artifact: PathBuf,
    marker: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = dir.path().join("downloads").join("minikube-test");
    let marker = dir.path().join("installed");
    Fixture {
        _dir: dir,
        artifact,
        marker,
    }
}

fn plan(fx: &Fixture, download: &str, start: &str) -> InstallPlan {
    plan_with_install(fx, download, "echo installing; touch \"$1\"", start)
}

fn plan_with_install(fx: &Fixture, download: &str, install: &str, start: &str) -> InstallPlan {
    InstallPlan {
        artifact: fx.artifact.clone(),
        download: sh(download, &fx.artifact),
        install: sh(install, &fx.marker),
        install_target: fx.marker.clone(),
        start: StartCommand::Fixed(sh(start, &fx.marker)),
    }
}

const GOOD_DOWNLOAD: &str = "sleep 0.1; printf '#####    25.0%%\\r'; sleep 0.1; printf 'binary' > \"$1\"; printf '##########  100.0%%\\n'";

async fn collect(mut rx: ProgressReceiver) -> Vec<ProgressUpdate> {
    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    updates
}

fn assert_monotonic(updates: &[ProgressUpdate]) {
    for pair in updates.windows(2) {
        assert!(
            pair[0].progress <= pair[1].progress,
            "progress went backwards: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn successful_install_reports_milestones_in_order() {
    let fx = fixture();
    let start = "sleep 0.2; echo 'minikube v1.33.1 on Linux'; sleep 0.2; \
                 echo 'Using the docker driver based on user configuration'; sleep 0.2; \
                 echo 'Creating docker container (CPUs=2) ...'; sleep 0.2; \
                 echo 'Done! kubectl is ready'";
    let (pipe, rx) = ProgressPipe::new(plan(&fx, GOOD_DOWNLOAD, start), CancellationToken::new());
    let handle = pipe.spawn();

    let updates = collect(rx).await;
    handle.await.expect("pipe task").expect("install succeeded");

    assert_monotonic(&updates);
    let terminal = updates.last().expect("terminal update");
    assert!(terminal.done);
    assert_eq!(terminal.step, Step::Finished);
    assert_eq!(terminal.progress, 100);
    assert_eq!(updates.iter().filter(|u| u.done).count(), 1);

    let start_checkpoints: Vec<u8> = updates
        .iter()
        .filter(|u| u.step == Step::Start && u.raw_line.is_some())
        .map(|u| u.step_progress)
        .collect();
    assert_eq!(start_checkpoints, vec![5, 10, 20, 98]);
    assert!(updates
        .iter()
        .any(|u| u.step == Step::Start && u.message == "Initializing..."));

    assert!(fx.marker.exists(), "install command ran");
    assert!(!fx.artifact.exists(), "artifact cleaned up");
}

#[test_timeout::tokio_timeout_test(30)]
async fn failed_download_ends_with_single_error() {
    let fx = fixture();
    let download = "sleep 0.1; printf '###   10.0%%\\r'; echo 'curl: (22) 404' 1>&2; exit 22";
    let (pipe, rx) = ProgressPipe::new(plan(&fx, download, "true"), CancellationToken::new());
    let handle = pipe.spawn();

    let updates = collect(rx).await;
    let result = handle.await.expect("pipe task");
    assert!(matches!(result, Err(StreamError::ExternalProcess(ref m)) if m.contains("download failed")));

    assert_monotonic(&updates);
    assert!(updates[..updates.len() - 1]
        .iter()
        .all(|u| u.step == Step::Download && !u.done));
    let terminal = updates.last().expect("terminal");
    assert!(terminal.done);
    assert_eq!(terminal.step, Step::Error);
    assert!(terminal.error.as_deref().is_some_and(|e| e.contains("download failed")));
    assert!(!fx.marker.exists(), "install never started");
}

#[test_timeout::tokio_timeout_test(30)]
async fn missing_artifact_is_a_download_failure() {
    let fx = fixture();
    let (pipe, rx) = ProgressPipe::new(plan(&fx, "echo fetched", "true"), CancellationToken::new());
    let handle = pipe.spawn();
    let updates = collect(rx).await;
    let _ = handle.await.expect("pipe task");

    let terminal = updates.last().expect("terminal");
    assert_eq!(terminal.step, Step::Error);
    assert!(terminal.message.contains("downloaded file not found"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn listener_leaving_aborts_before_next_phase_and_cleans_up() {
    let fx = fixture();
    let download = "printf 'binary' > \"$1\"; sleep 0.5; echo fetched";
    let gone = CancellationToken::new();
    let (pipe, mut rx) = ProgressPipe::new(plan(&fx, download, "true"), gone.clone());
    let handle = pipe.spawn();

    let first = rx.recv().await.expect("first update");
    assert_eq!(first.step, Step::Download);
    gone.cancel();
    drop(rx);

    let started = Instant::now();
    let result = handle.await.expect("pipe task");
    assert!(matches!(result, Err(StreamError::ExternalProcess(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!fx.marker.exists(), "install phase never started");
    assert!(!fx.artifact.exists(), "artifact cleaned up");
}

#[test_timeout::tokio_timeout_test(30)]
async fn stalled_listener_sees_only_the_latest_update() {
    let fx = fixture();
    let start = "for i in 1 2 3 4 5 6 7 8; do echo \"Downloading kubelet $i\"; done; echo 'Done! kubectl is ready'";
    let (pipe, rx) = ProgressPipe::new(plan(&fx, GOOD_DOWNLOAD, start), CancellationToken::new());

    let started = Instant::now();
    let result = pipe.run().await;
    assert!(result.is_ok());
    assert!(started.elapsed() < Duration::from_secs(10));

    // Older intermediate updates were replaced while nobody was reading.
    let updates = collect(rx).await;
    assert_eq!(updates.len(), 2, "{updates:?}");
    assert!(!updates[0].done);
    assert_eq!(updates[0].step, Step::Start);
    assert_eq!(updates[0].step_progress, 98);
    assert!(updates[0].raw_line.as_deref().is_some_and(|line| line.contains("Done!")));
    assert!(updates[1].done);
    assert_eq!(updates[1].step, Step::Finished);
}

#[test_timeout::tokio_timeout_test(30)]
async fn install_failure_after_download_milestone_ends_with_single_error() {
    let fx = fixture();
    let download = "printf 'binary' > \"$1\"; echo 'Downloading kubelet v1.30.0'; sleep 0.2";
    let install = "echo 'install: cannot create regular file: Permission denied' 1>&2; exit 1";
    let (pipe, mut rx) = ProgressPipe::new(plan_with_install(&fx, download, install, "true"), CancellationToken::new());
    let handle = pipe.spawn();

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    let result = handle.await.expect("pipe task");
    assert!(matches!(result, Err(StreamError::ExternalProcess(_))));

    assert_monotonic(&updates);
    assert!(updates
        .iter()
        .any(|u| u.step == Step::Download && u.step_progress == 40 && u.message == "Downloading Kubelet"));
    assert_eq!(updates.iter().filter(|u| u.done).count(), 1);
    let terminal = updates.last().expect("terminal");
    assert!(terminal.done);
    assert_eq!(terminal.step, Step::Error);
    assert_eq!(terminal.progress, 38);
    assert_eq!(terminal.step_progress, 80);
    assert!(terminal.error.as_deref().is_some_and(|e| e.contains("permission denied")));
    assert!(!fx.artifact.exists(), "artifact cleaned up");
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_plan_sends_only_a_terminal_error() {
    let (pipe, rx) = ProgressPipe::rejected("unsupported operating system: windows", CancellationToken::new());
    let handle = pipe.spawn();
    let updates = collect(rx).await;
    let _ = handle.await.expect("pipe task");

    assert_eq!(updates.len(), 1);
    assert!(updates[0].done);
    assert_eq!(updates[0].step, Step::Error);
    assert_eq!(updates[0].error.as_deref(), Some("unsupported operating system: windows"));
}
