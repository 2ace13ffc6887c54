//! The commands an installation runs, resolved before any of them start.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const MINIKUBE_INSTALL_TARGET: &str = "/usr/local/bin/minikube";
pub const DEFAULT_RELEASE: &str = "latest";
pub const DEFAULT_DRIVER: &str = "docker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

/// The start command's program is either fixed up front or located on the
/// host when the start phase begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCommand {
    Fixed(CommandSpec),
    Minikube {
        configured: Option<PathBuf>,
        args: Vec<OsString>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Where the download lands; removed when the pipe finishes.
    pub artifact: PathBuf,
    pub download: CommandSpec,
    pub install: CommandSpec,
    /// Where the install command puts the binary.
    pub install_target: PathBuf,
    pub start: StartCommand,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallerSettings {
    pub minikube_path: Option<PathBuf>,
    pub minikube_driver: String,
    pub download_dir: PathBuf,
    pub release: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("unsupported operating system: {0}")]
    UnsupportedOs(String),
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),
}

impl InstallPlan {
    pub fn for_host(settings: &InstallerSettings) -> Result<Self, PlanError> {
        Self::for_platform(settings, std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn for_platform(settings: &InstallerSettings, os: &str, arch: &str) -> Result<Self, PlanError> {
        let os = match os {
            "linux" | "darwin" => os,
            "macos" => "darwin",
            other => return Err(PlanError::UnsupportedOs(other.to_string())),
        };
        let arch = match arch {
            "x86_64" | "amd64" => "amd64",
            "aarch64" | "arm64" => "arm64",
            other => return Err(PlanError::UnsupportedArch(other.to_string())),
        };

        let release = if settings.release.trim().is_empty() {
            DEFAULT_RELEASE
        } else {
            settings.release.trim()
        };
        let driver = if settings.minikube_driver.trim().is_empty() {
            DEFAULT_DRIVER
        } else {
            settings.minikube_driver.trim()
        };
        let file_name = format!("minikube-{os}-{arch}");
        let url = if release == DEFAULT_RELEASE {
            format!("https://github.com/kubernetes/minikube/releases/latest/download/{file_name}")
        } else {
            format!("https://github.com/kubernetes/minikube/releases/download/{release}/{file_name}")
        };
        let download_dir = if settings.download_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            settings.download_dir.clone()
        };
        let artifact = download_dir.join(&file_name);

        Ok(InstallPlan {
            download: CommandSpec::new(
                "curl",
                [OsString::from("-#"), "-Lo".into(), artifact.clone().into_os_string(), url.into()],
            ),
            install: CommandSpec::new(
                "sudo",
                [
                    OsString::from("install"),
                    artifact.clone().into_os_string(),
                    MINIKUBE_INSTALL_TARGET.into(),
                ],
            ),
            install_target: PathBuf::from(MINIKUBE_INSTALL_TARGET),
            start: StartCommand::Minikube {
                configured: settings.minikube_path.clone(),
                args: vec!["start".into(), "--force".into(), format!("--driver={driver}").into()],
            },
            artifact,
        })
    }
}

/// `PATH`, then the standard install location, then the configured path.
pub fn resolve_minikube(configured: Option<&Path>) -> Option<PathBuf> {
    which::which("minikube")
        .ok()
        .or_else(|| executable(Path::new(MINIKUBE_INSTALL_TARGET)))
        .or_else(|| configured.and_then(executable))
}

fn executable(path: &Path) -> Option<PathBuf> {
    which::which(path).ok()
}
