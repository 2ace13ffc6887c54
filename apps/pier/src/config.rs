use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pier_stream::progress::InstallerSettings;
use serde::Deserialize;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Parser)]
#[command(
    name = "pier",
    author,
    version,
    about = "Kubernetes streaming backend (exec, watch, logs, installer)"
)]
pub struct Cli {
    /// Optional YAML configuration file.
    #[arg(long, env = "PIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP listener to. Overrides the config file.
    #[arg(long, env = "PIER_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub kubernetes: KubernetesSection,
    #[serde(default)]
    pub watch: WatchSection,
    #[serde(default)]
    pub installer: InstallerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesSection {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

impl Default for KubernetesSection {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kubeconfig: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_watch_timeout")]
    pub timeout_secs: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_watch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallerSection {
    #[serde(default)]
    pub minikube_path: Option<String>,
    #[serde(default = "default_driver")]
    pub minikube_driver: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default = "default_release")]
    pub release: String,
}

impl Default for InstallerSection {
    fn default() -> Self {
        Self {
            minikube_path: None,
            minikube_driver: default_driver(),
            download_dir: default_download_dir(),
            release: default_release(),
        }
    }
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_watch_timeout() -> u64 {
    DEFAULT_WATCH_TIMEOUT_SECS
}

fn default_driver() -> String {
    pier_stream::progress::plan::DEFAULT_DRIVER.to_string()
}

fn default_download_dir() -> String {
    ".".to_string()
}

fn default_release() -> String {
    pier_stream::progress::plan::DEFAULT_RELEASE.to_string()
}

impl AppConfig {
    /// Layers the optional file under `PIER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix("PIER").separator("__"))
            .build()
            .context("failed to read configuration")?
            .try_deserialize::<AppConfig>()
            .context("invalid configuration")
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.server.listen_addr = normalize_opt(self.server.listen_addr.take());
        self.kubernetes.kubeconfig = normalize_opt(self.kubernetes.kubeconfig.take());
        self.kubernetes.context = normalize_opt(self.kubernetes.context.take());
        self.installer.minikube_path = normalize_opt(self.installer.minikube_path.take());
        if self.kubernetes.kubectl.trim().is_empty() {
            self.kubernetes.kubectl = default_kubectl();
        }
        if self.installer.minikube_driver.trim().is_empty() {
            self.installer.minikube_driver = default_driver();
        }
        if self.installer.download_dir.trim().is_empty() {
            self.installer.download_dir = default_download_dir();
        }
        self
    }

    /// `"default"` means `$KUBECONFIG`, else `~/.kube/config`.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        match self.kubernetes.kubeconfig.as_deref() {
            None => None,
            Some("default") => std::env::var_os("KUBECONFIG")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| dirs::home_dir().map(|home| home.join(".kube").join("config"))),
            Some(path) => Some(PathBuf::from(path)),
        }
    }

    pub fn installer_settings(&self) -> InstallerSettings {
        InstallerSettings {
            minikube_path: self.installer.minikube_path.as_ref().map(PathBuf::from),
            minikube_driver: self.installer.minikube_driver.clone(),
            download_dir: PathBuf::from(&self.installer.download_dir),
            release: self.installer.release.clone(),
        }
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Everything the server needs, resolved from CLI, file and environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub watch_timeout: Duration,
    pub app: AppConfig,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let app = AppConfig::load(cli.config.as_deref())?;
        let raw_addr = cli
            .listen_addr
            .or_else(|| app.server.listen_addr.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = raw_addr
            .parse()
            .with_context(|| format!("invalid listen address: {raw_addr}"))?;
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            watch_timeout: Duration::from_secs(app.watch.timeout_secs.max(1)),
            app,
        })
    }
}
