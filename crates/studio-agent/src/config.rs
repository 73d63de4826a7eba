use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use studio_process::ServiceId;

use crate::services::{self, Layout, ServiceOverride, ServiceSpec};
use crate::support::{millis_clamped, parse_flag, parse_port, parse_usize};

const DEFAULT_BACKEND_PORT: u16 = 8000;
const DEFAULT_FRONTEND_PORT: u16 = 5173;
const DEFAULT_VOICE_CHANGER_PORT: u16 = 18888;
const DEFAULT_LOG_MAX_LINES: usize = 50;
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:18700";

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub python: String,
    pub backend_port: u16,
    pub frontend_port: u16,
    pub voice_changer_port: u16,
    /// Wait between the polite stop signal and the forced kill.
    pub stop_grace: Duration,
    /// Upper bound for stopping everything at application exit.
    pub shutdown_timeout: Duration,
    /// Pause after terminating a port owner so the OS releases the socket.
    pub port_release_delay: Duration,
    pub log_max_lines: usize,
    pub log_files: bool,
    pub control_addr: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub services: BTreeMap<ServiceId, ServiceSpec>,
}

/// Shape of the optional `STUDIO_CONFIG` TOML file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    python: Option<String>,
    backend_port: Option<u16>,
    frontend_port: Option<u16>,
    voice_changer_port: Option<u16>,
    stop_grace_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    port_release_ms: Option<u64>,
    log_max_lines: Option<usize>,
    log_files: Option<bool>,
    control_addr: Option<SocketAddr>,
    allowed_origins: Option<Vec<String>>,
    #[serde(default)]
    services: BTreeMap<String, ServiceOverride>,
}

fn default_origins(frontend_port: u16) -> Vec<String> {
    vec![
        format!("http://localhost:{frontend_port}"),
        format!("http://127.0.0.1:{frontend_port}"),
    ]
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl StudioConfig {
    /// Defaults plus environment, plus the TOML file named by `STUDIO_CONFIG`.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Self::from_env();
        if let Ok(path) = std::env::var("STUDIO_CONFIG") {
            let path = PathBuf::from(path.trim());
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config {}", path.display()))?;
            cfg.apply_toml(&raw)
                .with_context(|| format!("apply config {}", path.display()))?;
        }
        Ok(cfg)
    }

    pub fn from_env() -> Self {
        Self::from_vars(|k| std::env::var(k).ok())
    }

    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let root = get("STUDIO_ROOT")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let data_dir = get("STUDIO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("data"));
        let frontend_port = parse_port(get("STUDIO_FRONTEND_PORT")).unwrap_or(DEFAULT_FRONTEND_PORT);

        let mut cfg = Self {
            python: get("STUDIO_PYTHON")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "python".to_string()),
            backend_port: parse_port(get("STUDIO_BACKEND_PORT")).unwrap_or(DEFAULT_BACKEND_PORT),
            frontend_port,
            voice_changer_port: parse_port(get("STUDIO_VOICE_CHANGER_PORT"))
                .unwrap_or(DEFAULT_VOICE_CHANGER_PORT),
            stop_grace: millis_clamped(get("STUDIO_STOP_GRACE_MS"), 100, 60_000, 5_000),
            shutdown_timeout: millis_clamped(
                get("STUDIO_SHUTDOWN_TIMEOUT_MS"),
                1_000,
                120_000,
                15_000,
            ),
            port_release_delay: millis_clamped(get("STUDIO_PORT_RELEASE_MS"), 0, 10_000, 500),
            log_max_lines: parse_usize(get("STUDIO_LOG_MAX_LINES"))
                .map(|v| v.clamp(10, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
            log_files: parse_flag(get("STUDIO_LOG_FILES")).unwrap_or(true),
            control_addr: get("STUDIO_CONTROL_ADDR")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_else(|| {
                    DEFAULT_CONTROL_ADDR
                        .parse()
                        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 18700)))
                }),
            allowed_origins: get("STUDIO_ALLOWED_ORIGINS")
                .map(|v| parse_origins(&v))
                .unwrap_or_else(|| default_origins(frontend_port)),
            root,
            data_dir,
            services: BTreeMap::new(),
        };
        cfg.rebuild_services();
        cfg
    }

    pub fn apply_toml(&mut self, raw: &str) -> anyhow::Result<()> {
        let file: FileConfig = toml::from_str(raw).context("parse TOML")?;

        if let Some(root) = file.root {
            // Keep data_dir relative to the new root unless it is set explicitly.
            if self.data_dir == self.root.join("data") && file.data_dir.is_none() {
                self.data_dir = root.join("data");
            }
            self.root = root;
        }
        if let Some(dir) = file.data_dir {
            self.data_dir = dir;
        }
        if let Some(python) = file.python {
            self.python = python;
        }
        if let Some(p) = file.backend_port.filter(|p| *p != 0) {
            self.backend_port = p;
        }
        if let Some(p) = file.frontend_port.filter(|p| *p != 0) {
            self.frontend_port = p;
        }
        if let Some(p) = file.voice_changer_port.filter(|p| *p != 0) {
            self.voice_changer_port = p;
        }
        if let Some(ms) = file.stop_grace_ms {
            self.stop_grace = Duration::from_millis(ms.clamp(100, 60_000));
        }
        if let Some(ms) = file.shutdown_timeout_ms {
            self.shutdown_timeout = Duration::from_millis(ms.clamp(1_000, 120_000));
        }
        if let Some(ms) = file.port_release_ms {
            self.port_release_delay = Duration::from_millis(ms.clamp(0, 10_000));
        }
        if let Some(n) = file.log_max_lines {
            self.log_max_lines = n.clamp(10, 50_000);
        }
        if let Some(on) = file.log_files {
            self.log_files = on;
        }
        if let Some(addr) = file.control_addr {
            self.control_addr = addr;
        }
        if let Some(origins) = file.allowed_origins {
            self.allowed_origins = origins;
        }

        self.rebuild_services();
        for (key, ov) in file.services {
            let id: ServiceId = key.parse()?;
            let spec = self
                .services
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("no default spec for service {id}"))?;
            ov.apply(spec)?;
        }
        Ok(())
    }

    fn rebuild_services(&mut self) {
        self.services = services::default_specs(&Layout {
            root: &self.root,
            data_dir: &self.data_dir,
            python: &self.python,
            backend_port: self.backend_port,
            frontend_port: self.frontend_port,
            voice_changer_port: self.voice_changer_port,
        });
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Prebuilt voice-training UI, preferred over the dev server when present.
    pub fn frontend_dist(&self) -> PathBuf {
        services::frontend_dist_dir(&self.root)
    }

    pub fn frontend_url(&self) -> String {
        services::local_url(self.frontend_port)
    }

    pub fn voice_changer_url(&self) -> String {
        services::local_url(self.voice_changer_port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_known_ports() {
        let env = vars(&[("STUDIO_ROOT", "/studio")]);
        let cfg = StudioConfig::from_vars(|k| env.get(k).cloned());
        assert_eq!(cfg.backend_port, 8000);
        assert_eq!(cfg.frontend_port, 5173);
        assert_eq!(cfg.voice_changer_port, 18888);
        assert_eq!(cfg.data_dir, PathBuf::from("/studio/data"));
        assert_eq!(cfg.log_max_lines, 50);
        assert_eq!(cfg.frontend_url(), "http://localhost:5173/");
        assert_eq!(cfg.services.len(), ServiceId::ALL.len());
    }

    #[test]
    fn env_values_are_clamped_and_flow_into_specs() {
        let env = vars(&[
            ("STUDIO_ROOT", "/studio"),
            ("STUDIO_BACKEND_PORT", "9001"),
            ("STUDIO_STOP_GRACE_MS", "1"),
            ("STUDIO_LOG_MAX_LINES", "999999"),
            ("STUDIO_LOG_FILES", "off"),
        ]);
        let cfg = StudioConfig::from_vars(|k| env.get(k).cloned());
        assert_eq!(cfg.stop_grace, Duration::from_millis(100));
        assert_eq!(cfg.log_max_lines, 50_000);
        assert!(!cfg.log_files);
        let backend = &cfg.services[&ServiceId::Backend];
        assert_eq!(backend.port, Some(9001));
        assert!(backend.args.iter().any(|a| a == "9001"));
    }

    #[test]
    fn toml_overrides_ports_and_services() {
        let env = vars(&[("STUDIO_ROOT", "/studio")]);
        let mut cfg = StudioConfig::from_vars(|k| env.get(k).cloned());
        cfg.apply_toml(
            r#"
            voice_changer_port = 18999
            stop_grace_ms = 2500

            [services.voice-changer]
            command = "python"
            args = ["server.py"]
            on_readiness_timeout = "fail"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.stop_grace, Duration::from_millis(2500));
        let vc = &cfg.services[&ServiceId::VoiceChanger];
        assert_eq!(vc.port, Some(18999));
        assert_eq!(vc.command, "python");
        assert_eq!(vc.args, vec!["server.py".to_string()]);
        assert_eq!(vc.readiness.as_ref().unwrap().url, "http://localhost:18999/");
    }

    #[test]
    fn toml_root_moves_implicit_data_dir() {
        let env = vars(&[("STUDIO_ROOT", "/studio")]);
        let mut cfg = StudioConfig::from_vars(|k| env.get(k).cloned());
        cfg.apply_toml("root = \"/elsewhere\"").unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/elsewhere/data"));
    }

    #[test]
    fn toml_rejects_unknown_service() {
        let env = vars(&[("STUDIO_ROOT", "/studio")]);
        let mut cfg = StudioConfig::from_vars(|k| env.get(k).cloned());
        assert!(cfg.apply_toml("[services.database]\ncommand = \"x\"").is_err());
    }
}
