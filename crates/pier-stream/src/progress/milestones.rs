//! Maps external-process output lines onto progress checkpoints.

/// One row of the checkpoint table. Every string in `all` must occur and, if
/// `any` is non-empty, at least one of its strings must occur.
#[derive(Debug, Clone, Copy)]
pub struct Milestone {
    pub progress: u8,
    all: &'static [&'static str],
    any: &'static [&'static str],
    case_sensitive: bool,
    label: Option<&'static str>,
}

const fn row(progress: u8, all: &'static [&'static str], label: Option<&'static str>) -> Milestone {
    Milestone {
        progress,
        all,
        any: &[],
        case_sensitive: false,
        label,
    }
}

const fn row_any(progress: u8, all: &'static [&'static str], any: &'static [&'static str]) -> Milestone {
    Milestone {
        progress,
        all,
        any,
        case_sensitive: false,
        label: None,
    }
}

/// Checked top to bottom; the first match wins.
pub const MILESTONES: &[Milestone] = &[
    Milestone {
        progress: 5,
        all: &["minikube v"],
        any: &[],
        case_sensitive: true,
        label: Some("Initializing..."),
    },
    row(10, &["using the", "driver"], None),
    row(15, &["starting control plane node"], None),
    row_any(20, &["creating"], &["container", "vm"]),
    row(30, &["preparing kubernetes"], None),
    row(35, &["pulling base image"], None),
    row(40, &["downloading", "kubelet"], Some("Downloading Kubelet")),
    row(45, &["downloading", "kubeadm"], Some("Downloading Kubeadm")),
    row(50, &["downloading", "kubectl"], Some("Downloading Kubectl")),
    row(55, &["downloading", "cni"], Some("Downloading CNI plugins")),
    row(60, &["downloading"], None),
    row(65, &["verifying kubernetes components"], None),
    row(70, &["generating certificates"], None),
    row(75, &["booting up control plane"], None),
    row_any(80, &[], &["configuring", "waiting for"]),
    row(85, &["setting up kubeconfig"], None),
    row(90, &["enabling addons"], None),
    row(95, &["kubectl is now configured"], None),
    row_any(98, &[], &["done!", "successfully"]),
];

impl Milestone {
    fn matches(&self, line: &str, lowered: &str) -> bool {
        let text = if self.case_sensitive { line } else { lowered };
        self.all.iter().all(|needle| text.contains(needle))
            && (self.any.is_empty() || self.any.iter().any(|needle| text.contains(needle)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestoneMatch {
    /// Phase-local progress, 0..=100.
    pub progress: u8,
    pub message: String,
}

pub fn match_line(line: &str) -> Option<MilestoneMatch> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let lowered = line.to_lowercase();
    MILESTONES
        .iter()
        .find(|m| m.matches(line, &lowered))
        .map(|m| MilestoneMatch {
            progress: m.progress,
            message: m.label.map_or_else(|| line.to_string(), str::to_string),
        })
}

/// Percentage from a curl `-#` progress segment such as
/// `######                                  12.5%`.
pub fn curl_percent(segment: &str) -> Option<f64> {
    let trimmed = segment.trim();
    if !trimmed.contains('%') || !(trimmed.starts_with('#') || trimmed.contains("curl")) {
        return None;
    }
    let last = trimmed.split_whitespace().last()?;
    let value: f64 = last.strip_suffix('%')?.parse().ok()?;
    (value > 0.0).then(|| value.min(100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let cases = [
            ("😄  minikube v1.33.1 on Ubuntu 22.04", 5, "Initializing..."),
            ("✨  Using the docker driver based on user configuration", 10, ""),
            ("👍  Starting control plane node minikube in cluster minikube", 15, ""),
            ("🔥  Creating docker container (CPUs=2, Memory=3900MB) ...", 20, ""),
            ("🐳  Preparing Kubernetes v1.30.0 on Docker 26.1.1 ...", 30, ""),
            ("🚜  Pulling base image v0.0.44 ...", 35, ""),
            ("    > kubelet.sha256: Downloading kubelet", 40, "Downloading Kubelet"),
            ("    > Downloading kubeadm v1.30.0", 45, "Downloading Kubeadm"),
            ("    > Downloading kubectl v1.30.0", 50, "Downloading Kubectl"),
            ("    > Downloading CNI plugins", 55, "Downloading CNI plugins"),
            ("💾  Downloading Kubernetes v1.30.0 preload ...", 60, ""),
            ("🔎  Verifying Kubernetes components...", 65, ""),
            ("    ▪ Generating certificates and keys ...", 70, ""),
            ("    ▪ Booting up control plane ...", 75, ""),
            ("    ▪ Configuring RBAC rules ...", 80, ""),
            ("    ▪ Waiting for apiserver", 80, ""),
            ("    ▪ Setting up kubeconfig", 85, ""),
            ("🌟  Enabling addons: storage-provisioner", 90, ""),
            ("💡  kubectl is now configured to use \"minikube\"", 95, ""),
            ("🏄  Done! kubectl is ready", 98, ""),
        ];
        for (line, progress, label) in cases {
            let found = match_line(line).unwrap_or_else(|| panic!("no match for {line:?}"));
            assert_eq!(found.progress, progress, "{line:?}");
            if !label.is_empty() {
                assert_eq!(found.message, label);
            } else {
                assert_eq!(found.message, line.trim());
            }
        }
    }

    #[test]
    fn version_banner_is_case_sensitive() {
        assert!(match_line("MINIKUBE V1.0").is_none());
    }

    #[test]
    fn unmatched_lines_have_no_checkpoint() {
        assert!(match_line("random chatter").is_none());
        assert!(match_line("   ").is_none());
    }

    #[test]
    fn parses_curl_progress() {
        assert_eq!(curl_percent("##########                    38.5%"), Some(38.5));
        assert_eq!(curl_percent("#################################### 100.0%"), Some(100.0));
        assert_eq!(curl_percent("                                   0.0%"), None);
        assert_eq!(curl_percent("#=#=#"), None);
        assert_eq!(curl_percent("curl: (6) Could not resolve host"), None);
    }
}
