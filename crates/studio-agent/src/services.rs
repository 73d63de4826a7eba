use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use studio_process::ServiceId;

/// Stderr substrings that come from embedded database lock contention and are
/// harmless in every service.
pub const GLOBAL_BENIGN_STDERR: &[&str] = &[
    "database is locked",
    "could not obtain lock",
    "lock file",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessCheck {
    pub url: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

/// What to do with a process that is alive but never answered its health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessTimeoutPolicy {
    /// Keep it `Running` and report it as degraded.
    Degrade,
    /// Mark it `Failed` and terminate it.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StderrPolicy {
    /// Lines containing any of these are downgraded to `info`.
    pub benign: Vec<String>,
    /// Lines containing any of these are dropped.
    pub suppress: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Port that must be free before spawning.
    pub port: Option<u16>,
    pub readiness: Option<ReadinessCheck>,
    pub on_readiness_timeout: ReadinessTimeoutPolicy,
    pub stderr: StderrPolicy,
}

/// Inputs the default service table is derived from.
#[derive(Debug, Clone)]
pub struct Layout<'a> {
    pub root: &'a Path,
    pub data_dir: &'a Path,
    pub python: &'a str,
    pub backend_port: u16,
    pub frontend_port: u16,
    pub voice_changer_port: u16,
}

pub fn app_dir(root: &Path) -> PathBuf {
    root.join("src").join("tha4").join("app")
}

pub fn frontend_dir(root: &Path) -> PathBuf {
    root.join("frontend")
}

pub fn frontend_dist_dir(root: &Path) -> PathBuf {
    frontend_dir(root).join("dist")
}

pub fn voice_changer_dir(root: &Path) -> PathBuf {
    if cfg!(windows) {
        root.join("dist").join("main")
    } else {
        root.join("dist")
    }
}

pub fn local_url(port: u16) -> String {
    format!("http://localhost:{port}/")
}

fn benign(extra: &[&str]) -> Vec<String> {
    GLOBAL_BENIGN_STDERR
        .iter()
        .chain(extra.iter())
        .map(|s| s.to_string())
        .collect()
}

fn python_env(extra: &[(&str, String)]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    // Line-buffered output so the log panel sees lines as they happen.
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    for (k, v) in extra {
        env.insert(k.to_string(), v.clone());
    }
    env
}

fn voice_changer_command(dir: &Path) -> (String, Vec<String>) {
    if cfg!(windows) {
        let script = dir.join("start_https.bat");
        (
            "cmd".to_string(),
            vec!["/C".to_string(), script.display().to_string()],
        )
    } else if cfg!(target_os = "macos") {
        let script = dir.join("start_https.command");
        ("bash".to_string(), vec![script.display().to_string()])
    } else {
        let script = dir.join("start_https.sh");
        ("bash".to_string(), vec![script.display().to_string()])
    }
}

pub fn default_specs(layout: &Layout<'_>) -> BTreeMap<ServiceId, ServiceSpec> {
    let mut out = BTreeMap::new();

    let app = app_dir(layout.root);
    out.insert(
        ServiceId::Overlay,
        ServiceSpec {
            id: ServiceId::Overlay,
            command: layout.python.to_string(),
            args: vec![app.join("overlay_window.py").display().to_string()],
            working_dir: app,
            env: python_env(&[(
                "VTUBER_DATA_PATH",
                layout.data_dir.display().to_string(),
            )]),
            port: None,
            readiness: None,
            on_readiness_timeout: ReadinessTimeoutPolicy::Degrade,
            stderr: StderrPolicy {
                benign: benign(&[]),
                suppress: Vec::new(),
            },
        },
    );

    out.insert(
        ServiceId::Backend,
        ServiceSpec {
            id: ServiceId::Backend,
            command: layout.python.to_string(),
            args: vec![
                "-m".to_string(),
                "uvicorn".to_string(),
                "backend.main:app".to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                layout.backend_port.to_string(),
            ],
            working_dir: layout.root.to_path_buf(),
            env: python_env(&[]),
            port: Some(layout.backend_port),
            readiness: Some(ReadinessCheck {
                url: local_url(layout.backend_port),
                timeout: Duration::from_secs(2),
                interval: Duration::from_millis(500),
                max_attempts: 60,
            }),
            on_readiness_timeout: ReadinessTimeoutPolicy::Degrade,
            // uvicorn writes its access and startup log to stderr.
            stderr: StderrPolicy {
                benign: benign(&["INFO:"]),
                suppress: Vec::new(),
            },
        },
    );

    out.insert(
        ServiceId::Frontend,
        ServiceSpec {
            id: ServiceId::Frontend,
            command: if cfg!(windows) { "npm.cmd" } else { "npm" }.to_string(),
            args: vec![
                "run".to_string(),
                "dev".to_string(),
                "--".to_string(),
                "--port".to_string(),
                layout.frontend_port.to_string(),
                "--strictPort".to_string(),
            ],
            working_dir: frontend_dir(layout.root),
            env: BTreeMap::from([("BROWSER".to_string(), "none".to_string())]),
            port: Some(layout.frontend_port),
            readiness: Some(ReadinessCheck {
                url: local_url(layout.frontend_port),
                timeout: Duration::from_secs(2),
                interval: Duration::from_millis(500),
                max_attempts: 60,
            }),
            on_readiness_timeout: ReadinessTimeoutPolicy::Degrade,
            stderr: StderrPolicy {
                benign: benign(&["ExperimentalWarning"]),
                suppress: Vec::new(),
            },
        },
    );

    let vc_dir = voice_changer_dir(layout.root);
    let (command, args) = voice_changer_command(&vc_dir);
    out.insert(
        ServiceId::VoiceChanger,
        ServiceSpec {
            id: ServiceId::VoiceChanger,
            command,
            args,
            working_dir: vc_dir,
            env: python_env(&[]),
            port: Some(layout.voice_changer_port),
            // Model loading can take minutes on first start.
            readiness: Some(ReadinessCheck {
                url: local_url(layout.voice_changer_port),
                timeout: Duration::from_secs(3),
                interval: Duration::from_secs(2),
                max_attempts: 150,
            }),
            on_readiness_timeout: ReadinessTimeoutPolicy::Degrade,
            stderr: StderrPolicy {
                benign: benign(&[]),
                suppress: Vec::new(),
            },
        },
    );

    out
}

/// Per-service overrides read from the TOML config file.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceOverride {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    /// Merged into the default environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub port: Option<u16>,
    /// `false` disables the health check entirely.
    pub readiness: Option<bool>,
    pub readiness_url: Option<String>,
    pub readiness_timeout_ms: Option<u64>,
    pub readiness_interval_ms: Option<u64>,
    pub readiness_max_attempts: Option<u32>,
    pub on_readiness_timeout: Option<ReadinessTimeoutPolicy>,
    #[serde(default)]
    pub benign_stderr: Vec<String>,
    #[serde(default)]
    pub suppress_stderr: Vec<String>,
}

impl ServiceOverride {
    pub fn apply(self, spec: &mut ServiceSpec) -> anyhow::Result<()> {
        if let Some(command) = self.command {
            if command.trim().is_empty() {
                anyhow::bail!("{}: command must be non-empty", spec.id);
            }
            spec.command = command;
        }
        if let Some(args) = self.args {
            spec.args = args;
        }
        if let Some(dir) = self.working_dir {
            spec.working_dir = dir;
        }
        spec.env.extend(self.env);
        if let Some(port) = self.port {
            spec.port = if port == 0 { None } else { Some(port) };
        }

        if self.readiness == Some(false) {
            spec.readiness = None;
        } else {
            let wants_check = self.readiness == Some(true) || self.readiness_url.is_some();
            if spec.readiness.is_none() && wants_check {
                let url = self
                    .readiness_url
                    .clone()
                    .or_else(|| spec.port.map(local_url))
                    .ok_or_else(|| {
                        anyhow::anyhow!("{}: readiness enabled but no url or port", spec.id)
                    })?;
                spec.readiness = Some(ReadinessCheck {
                    url,
                    timeout: Duration::from_secs(2),
                    interval: Duration::from_millis(500),
                    max_attempts: 60,
                });
            }
            if let Some(check) = spec.readiness.as_mut() {
                if let Some(url) = self.readiness_url {
                    check.url = url;
                }
                if let Some(ms) = self.readiness_timeout_ms {
                    check.timeout = Duration::from_millis(ms.clamp(50, 60_000));
                }
                if let Some(ms) = self.readiness_interval_ms {
                    check.interval = Duration::from_millis(ms.clamp(10, 60_000));
                }
                if let Some(n) = self.readiness_max_attempts {
                    check.max_attempts = n.clamp(1, 10_000);
                }
            }
        }

        if let Some(policy) = self.on_readiness_timeout {
            spec.on_readiness_timeout = policy;
        }
        spec.stderr.benign.extend(self.benign_stderr);
        spec.stderr.suppress.extend(self.suppress_stderr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path) -> Layout<'_> {
        Layout {
            root,
            data_dir: Path::new("/data"),
            python: "python",
            backend_port: 8000,
            frontend_port: 5173,
            voice_changer_port: 18888,
        }
    }

    #[test]
    fn defaults_cover_every_service() {
        let specs = default_specs(&layout(Path::new("/studio")));
        for id in ServiceId::ALL {
            assert_eq!(specs.get(&id).map(|s| s.id), Some(id));
        }
    }

    #[test]
    fn overlay_gets_data_path_and_no_health_check() {
        let specs = default_specs(&layout(Path::new("/studio")));
        let overlay = &specs[&ServiceId::Overlay];
        assert_eq!(overlay.env.get("VTUBER_DATA_PATH").map(String::as_str), Some("/data"));
        assert!(overlay.readiness.is_none());
        assert!(overlay.port.is_none());
    }

    #[test]
    fn voice_changer_reclaims_fixed_port_with_long_budget() {
        let specs = default_specs(&layout(Path::new("/studio")));
        let vc = &specs[&ServiceId::VoiceChanger];
        assert_eq!(vc.port, Some(18888));
        let check = vc.readiness.as_ref().unwrap();
        assert_eq!(check.url, "http://localhost:18888/");
        assert!(check.interval * check.max_attempts >= Duration::from_secs(120));
    }

    #[test]
    fn override_disables_readiness_and_merges_env() {
        let mut specs = default_specs(&layout(Path::new("/studio")));
        let backend = specs.get_mut(&ServiceId::Backend).unwrap();
        let ov: ServiceOverride = toml::from_str(
            r#"
            readiness = false
            env = { APP_MODE = "dev" }
            benign_stderr = ["DeprecationWarning"]
            "#,
        )
        .unwrap();
        ov.apply(backend).unwrap();
        assert!(backend.readiness.is_none());
        assert_eq!(backend.env.get("APP_MODE").map(String::as_str), Some("dev"));
        assert_eq!(backend.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert!(backend.stderr.benign.iter().any(|s| s == "DeprecationWarning"));
    }

    #[test]
    fn override_enables_readiness_from_port() {
        let mut specs = default_specs(&layout(Path::new("/studio")));
        let overlay = specs.get_mut(&ServiceId::Overlay).unwrap();
        let ov: ServiceOverride = toml::from_str(
            r#"
            port = 9100
            readiness = true
            readiness_max_attempts = 3
            on_readiness_timeout = "fail"
            "#,
        )
        .unwrap();
        ov.apply(overlay).unwrap();
        let check = overlay.readiness.as_ref().unwrap();
        assert_eq!(check.url, "http://localhost:9100/");
        assert_eq!(check.max_attempts, 3);
        assert_eq!(overlay.on_readiness_timeout, ReadinessTimeoutPolicy::Fail);
    }

    #[test]
    fn override_rejects_unknown_fields() {
        let res = toml::from_str::<ServiceOverride>("cmd = \"x\"");
        assert!(res.is_err());
    }
}
