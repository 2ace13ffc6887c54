use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use pier_stream::progress::{InstallPlan, InstallerSettings, PlanError};
use pier_stream::{Executor, LogSource, ObjectStore, WatchSource};

/// Shared handles for every request. Cluster access goes through the
/// collaborator traits so tests can swap in fakes.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<dyn Executor>,
    pub watches: Arc<dyn WatchSource>,
    pub objects: Arc<dyn ObjectStore>,
    pub logs: Arc<dyn LogSource>,
    pub installer: Arc<InstallerSettings>,
    install_plan: Option<Arc<InstallPlan>>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        executor: Arc<dyn Executor>,
        watches: Arc<dyn WatchSource>,
        objects: Arc<dyn ObjectStore>,
        logs: Arc<dyn LogSource>,
        installer: InstallerSettings,
    ) -> Self {
        Self {
            executor,
            watches,
            objects,
            logs,
            installer: Arc::new(installer),
            install_plan: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Pins the plan instead of deriving one from the host platform.
    pub fn with_install_plan(mut self, plan: InstallPlan) -> Self {
        self.install_plan = Some(Arc::new(plan));
        self
    }

    pub fn install_plan(&self) -> Result<InstallPlan, PlanError> {
        match &self.install_plan {
            Some(plan) => Ok(plan.as_ref().clone()),
            None => InstallPlan::for_host(&self.installer),
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
    }
}
