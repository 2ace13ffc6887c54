//! A multi-phase installation task reporting structured progress to a single
//! best-effort listener.
//!
//! Intermediate updates are delivered at most once and never queued: when the
//! listener has not taken the previous update, the new one replaces it. The
//! terminal update (`done: true`) is attempted with a bounded wait and is the
//! last thing the pipe ever sends; the receiver ends right after it.

mod listener;
pub mod milestones;
pub mod plan;
mod process;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use listener::ProgressReceiver;
pub use plan::{CommandSpec, InstallPlan, InstallerSettings, PlanError, StartCommand};

use crate::error::StreamError;
use listener::Publisher;
use process::{OutputStream, SegmentHandler};

/// Bound on the wait for the listener to accept the terminal update.
pub const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Download,
    Install,
    Start,
    Finished,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub step: Step,
    /// Overall progress, 0..=100.
    pub progress: u8,
    /// Progress within the current phase, 0..=100.
    pub step_progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_line: Option<String>,
}

/// Each phase owns a slice of the overall range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Download,
    Install,
    Start,
}

impl Phase {
    /// `(base, span)` of the phase within overall progress.
    fn range(self) -> (u8, u8) {
        match self {
            Phase::Download => (5, 25),
            Phase::Install => (30, 10),
            Phase::Start => (40, 60),
        }
    }

    fn overall(self, step_progress: u8) -> u8 {
        let (base, span) = self.range();
        base + (u16::from(step_progress.min(100)) * u16::from(span) / 100) as u8
    }

    fn step_progress(self, overall: u8) -> u8 {
        let (base, span) = self.range();
        let into = overall.saturating_sub(base).min(span);
        (u16::from(into) * 100 / u16::from(span)) as u8
    }
}

/// A phase failure, carried to the terminal update.
#[derive(Debug, Clone)]
struct Failure {
    progress: u8,
    step_progress: u8,
    message: String,
}

impl Failure {
    fn new(progress: u8, step_progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress,
            step_progress,
            message: message.into(),
        }
    }

    fn listener_gone() -> Self {
        Self::new(0, 0, "client disconnected; installation aborted")
    }
}

impl From<Failure> for StreamError {
    fn from(failure: Failure) -> Self {
        StreamError::ExternalProcess(failure.message)
    }
}

#[derive(Clone)]
struct Reporter {
    tx: Publisher,
    listener_gone: CancellationToken,
    high_water: Arc<AtomicU8>,
}

impl Reporter {
    fn is_listening(&self) -> bool {
        !self.listener_gone.is_cancelled() && !self.tx.is_closed()
    }

    fn ensure_listening(&self) -> Result<(), Failure> {
        if self.is_listening() {
            Ok(())
        } else {
            Err(Failure::listener_gone())
        }
    }

    fn high_water(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Overall progress never goes backwards.
    fn clamp(&self, progress: u8) -> u8 {
        let progress = progress.min(100);
        self.high_water.fetch_max(progress, Ordering::SeqCst).max(progress)
    }

    fn progress(&self, step: Step, progress: u8, step_progress: u8, message: impl Into<String>, raw_line: Option<&str>) {
        if !self.is_listening() {
            return;
        }
        let update = ProgressUpdate {
            step,
            progress: self.clamp(progress),
            step_progress: step_progress.min(100),
            message: message.into(),
            error: None,
            done: false,
            raw_line: raw_line.map(str::to_string),
        };
        if let Some(stale) = self.tx.publish(update) {
            debug!(step = ?stale.step, progress = stale.progress, "listener busy; replacing progress update");
            counter!("pier_progress_updates_dropped_total", 1);
        }
    }

    /// Consumes the reporter so nothing can follow the terminal update.
    async fn finish(self, update: ProgressUpdate) {
        let step = update.step;
        match tokio::time::timeout(TERMINAL_SEND_TIMEOUT, self.tx.finish(update)).await {
            Ok(Ok(())) => debug!(?step, "terminal progress update delivered"),
            Ok(Err(_)) => debug!(?step, "listener gone before terminal update"),
            Err(_) => warn!(?step, "listener did not accept terminal update in time"),
        }
    }
}

/// Removes the downloaded artifact when dropped.
struct ArtifactGuard {
    path: PathBuf,
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed downloaded artifact"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove downloaded artifact"),
        }
    }
}

enum Work {
    Plan(InstallPlan),
    Rejected(String),
}

pub struct ProgressPipe {
    work: Work,
    reporter: Reporter,
}

impl ProgressPipe {
    /// `listener_gone` is cancelled by the consumer when it stops listening.
    pub fn new(plan: InstallPlan, listener_gone: CancellationToken) -> (Self, ProgressReceiver) {
        Self::with_work(Work::Plan(plan), listener_gone)
    }

    /// A pipe whose only update is a terminal error, for plans that could not
    /// be built.
    pub fn rejected(reason: impl Into<String>, listener_gone: CancellationToken) -> (Self, ProgressReceiver) {
        Self::with_work(Work::Rejected(reason.into()), listener_gone)
    }

    fn with_work(work: Work, listener_gone: CancellationToken) -> (Self, ProgressReceiver) {
        let (tx, rx) = listener::channel();
        let reporter = Reporter {
            tx,
            listener_gone,
            high_water: Arc::new(AtomicU8::new(0)),
        };
        (Self { work, reporter }, rx)
    }

    pub fn spawn(self) -> JoinHandle<Result<(), StreamError>> {
        tokio::spawn(self.run())
    }

    /// Runs every phase, then sends exactly one terminal update.
    pub async fn run(self) -> Result<(), StreamError> {
        let Self { work, reporter } = self;
        let started = Instant::now();
        let result = match &work {
            Work::Plan(plan) => drive(plan, &reporter).await,
            Work::Rejected(reason) => Err(Failure::new(0, 0, reason.clone())),
        };

        let terminal = match &result {
            Ok(()) => ProgressUpdate {
                step: Step::Finished,
                progress: reporter.clamp(100),
                step_progress: 100,
                message: "Minikube started successfully!".to_string(),
                error: None,
                done: true,
                raw_line: None,
            },
            Err(failure) => ProgressUpdate {
                step: Step::Error,
                progress: reporter.clamp(failure.progress),
                step_progress: failure.step_progress,
                message: failure.message.clone(),
                error: Some(failure.message.clone()),
                done: true,
                raw_line: None,
            },
        };
        match &result {
            Ok(()) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "installation finished"),
            Err(failure) => warn!(error = %failure.message, "installation failed"),
        }
        reporter.finish(terminal).await;
        result.map_err(StreamError::from)
    }
}

async fn drive(plan: &InstallPlan, reporter: &Reporter) -> Result<(), Failure> {
    if let Some(dir) = plan.artifact.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| Failure::new(2, 0, format!("cannot create download directory {}: {err}", dir.display())))?;
    }
    let _cleanup = ArtifactGuard {
        path: plan.artifact.clone(),
    };

    download(plan, reporter).await?;
    install(plan, reporter).await?;
    start(plan, reporter).await
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn download(plan: &InstallPlan, reporter: &Reporter) -> Result<(), Failure> {
    let name = file_name(&plan.artifact);
    reporter.progress(Step::Download, Phase::Download.overall(0), 0, format!("Downloading {name}..."), None);
    reporter.ensure_listening()?;

    let started = Instant::now();
    let last_percent = Arc::new(AtomicU8::new(0));
    let handler: SegmentHandler = {
        let reporter = reporter.clone();
        Arc::new(move |_stream, segment| {
            if let Some(percent) = milestones::curl_percent(segment) {
                let percent = percent as u8;
                if last_percent.fetch_max(percent, Ordering::SeqCst) < percent {
                    reporter.progress(
                        Step::Download,
                        Phase::Download.overall(percent),
                        percent,
                        format!("Downloading: {percent}%"),
                        Some(segment),
                    );
                }
            } else if let Some(found) = milestones::match_line(segment) {
                reporter.progress(
                    Step::Download,
                    Phase::Download.overall(found.progress),
                    found.progress,
                    found.message,
                    Some(segment),
                );
            }
        })
    };

    let output = process::run(&plan.download, handler)
        .await
        .map_err(|err| Failure::new(15, 0, format!("failed to run download command: {err}")))?;
    if !output.status.success() {
        return Err(Failure::new(15, 0, format!("download failed ({}): {}", output.status, output.captured.trim())));
    }
    if !plan.artifact.exists() {
        return Err(Failure::new(20, 0, format!("downloaded file not found: {}", plan.artifact.display())));
    }
    reporter.progress(
        Step::Download,
        Phase::Download.overall(100),
        100,
        format!("Download complete ({name}) in {:.1}s", started.elapsed().as_secs_f64()),
        None,
    );
    Ok(())
}

async fn install(plan: &InstallPlan, reporter: &Reporter) -> Result<(), Failure> {
    reporter.progress(
        Step::Install,
        Phase::Install.overall(10),
        10,
        format!("Preparing install command ({})", plan.install.display()),
        None,
    );
    reporter.progress(
        Step::Install,
        Phase::Install.overall(20),
        20,
        "Installing may require elevated privileges",
        None,
    );
    reporter.ensure_listening()?;

    let handler: SegmentHandler = {
        let reporter = reporter.clone();
        Arc::new(move |_stream, segment| match milestones::match_line(segment) {
            Some(found) => reporter.progress(
                Step::Install,
                Phase::Install.overall(found.progress),
                found.progress,
                found.message,
                Some(segment),
            ),
            None => reporter.progress(
                Step::Install,
                Phase::Install.overall(50),
                50,
                "Install command output",
                Some(segment),
            ),
        })
    };

    let output = process::run(&plan.install, handler)
        .await
        .map_err(|err| Failure::new(38, 80, format!("failed to run install command: {err}")))?;
    if !output.status.success() {
        let message = refine_install_error(plan, &output.captured)
            .unwrap_or_else(|| format!("install command failed ({}): {}", output.status, output.captured.trim()));
        return Err(Failure::new(38, 80, message));
    }
    reporter.progress(
        Step::Install,
        Phase::Install.overall(100),
        100,
        format!("Installed to {}", plan.install_target.display()),
        None,
    );
    Ok(())
}

fn refine_install_error(plan: &InstallPlan, output: &str) -> Option<String> {
    let target_dir = plan
        .install_target
        .parent()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    let artifact = plan.artifact.display().to_string();
    if output.contains("incorrect password attempt") || output.contains("a password is required") {
        Some("install failed: 'sudo install' needs a password or passwordless sudo is not configured".to_string())
    } else if output.contains("Permission denied") {
        Some(format!("install failed: permission denied writing to {target_dir}"))
    } else if output.contains("No such file or directory") && output.contains(&artifact) {
        Some(format!("install failed: source file '{artifact}' not found"))
    } else if output.contains("No such file or directory") && !target_dir.is_empty() && output.contains(&target_dir) {
        Some(format!("install failed: target directory '{target_dir}' does not exist"))
    } else {
        None
    }
}

fn start_command(plan: &InstallPlan) -> Result<CommandSpec, Failure> {
    match &plan.start {
        StartCommand::Fixed(spec) => Ok(spec.clone()),
        StartCommand::Minikube { configured, args } => plan::resolve_minikube(configured.as_deref())
            .map(|program| CommandSpec {
                program,
                args: args.clone(),
            })
            .ok_or_else(|| Failure::new(42, 0, "minikube executable not found on PATH, at /usr/local/bin/minikube, or at the configured path")),
    }
}

async fn start(plan: &InstallPlan, reporter: &Reporter) -> Result<(), Failure> {
    reporter.progress(Step::Start, Phase::Start.overall(0), 0, "Preparing to start minikube...", None);
    reporter.ensure_listening()?;
    let command = start_command(plan)?;
    reporter.progress(
        Step::Start,
        Phase::Start.overall(0),
        0,
        format!("Running: {}", command.display()),
        None,
    );

    let handler: SegmentHandler = {
        let reporter = reporter.clone();
        Arc::new(move |stream, segment| {
            let found = milestones::match_line(segment);
            let (progress, step_progress, message) = match found {
                Some(found) => (Phase::Start.overall(found.progress), found.progress, found.message),
                None => {
                    let current = reporter.high_water();
                    (current, Phase::Start.step_progress(current), segment.trim().to_string())
                }
            };
            let message = match stream {
                OutputStream::Stdout => message,
                OutputStream::Stderr => {
                    let lowered = segment.to_lowercase();
                    if lowered.contains("error") || lowered.contains("fail") {
                        format!("[Error log] {message}")
                    } else {
                        format!("[Log] {message}")
                    }
                }
            };
            reporter.progress(Step::Start, progress, step_progress, message, Some(segment));
        })
    };

    let output = process::run(&command, handler)
        .await
        .map_err(|err| Failure::new(42, 0, format!("failed to run minikube: {err}")))?;
    if !output.status.success() {
        let current = reporter.high_water();
        return Err(Failure::new(
            current,
            100,
            format!("minikube start failed ({})", output.status),
        ));
    }
    Ok(())
}
