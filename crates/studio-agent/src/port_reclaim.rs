use std::{sync::Arc, time::Duration};

use anyhow::Context;

use crate::support::format_error_chain;

const DEFAULT_ROUNDS: u32 = 3;

/// Finds and terminates the processes bound to a local port.
///
/// Implementations shell out to platform tools and may block; the reclaimer
/// calls them from a blocking task.
pub trait PortOwners: Send + Sync {
    fn owners(&self, port: u16) -> anyhow::Result<Vec<u32>>;
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;
}

/// Result of one reclaim attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortClaim {
    pub port: u16,
    /// Every owner pid seen during the attempt.
    pub owners: Vec<u32>,
    pub terminated: Vec<u32>,
    /// Owners still bound after the last round.
    pub remaining: Vec<u32>,
}

impl PortClaim {
    pub fn is_clear(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn conflict(&self) -> Option<PortConflictError> {
        if self.is_clear() {
            return None;
        }
        Some(PortConflictError {
            port: self.port,
            owners: self.remaining.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("port {port} is still held by pid(s) {owners:?}")]
pub struct PortConflictError {
    pub port: u16,
    pub owners: Vec<u32>,
}

#[derive(Clone)]
pub struct PortReclaimer {
    owners: Arc<dyn PortOwners>,
    release_delay: Duration,
    rounds: u32,
}

impl PortReclaimer {
    pub fn new(owners: Arc<dyn PortOwners>, release_delay: Duration) -> Self {
        Self {
            owners,
            release_delay,
            rounds: DEFAULT_ROUNDS,
        }
    }

    pub fn system(release_delay: Duration) -> Self {
        Self::new(Arc::new(SystemPortOwners), release_delay)
    }

    async fn find(&self, port: u16) -> anyhow::Result<Vec<u32>> {
        let owners = self.owners.clone();
        let me = std::process::id();
        let mut pids = tokio::task::spawn_blocking(move || owners.owners(port))
            .await
            .context("port owner lookup task")??;
        pids.retain(|p| *p != me && *p != 0);
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Best effort: lookup and termination failures are logged, never returned.
    pub async fn reclaim(&self, port: u16) -> PortClaim {
        let mut claim = PortClaim {
            port,
            ..Default::default()
        };

        for round in 1..=self.rounds.max(1) {
            let pids = match self.find(port).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(port, error = %format_error_chain(&e), "port owner lookup failed");
                    claim.remaining.clear();
                    return claim;
                }
            };
            if pids.is_empty() {
                claim.remaining.clear();
                return claim;
            }

            tracing::info!(port, ?pids, round, "reclaiming port from stale owners");
            for pid in &pids {
                if !claim.owners.contains(pid) {
                    claim.owners.push(*pid);
                }
                let owners = self.owners.clone();
                let pid = *pid;
                let res = tokio::task::spawn_blocking(move || owners.terminate(pid))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r);
                match res {
                    Ok(()) => {
                        if !claim.terminated.contains(&pid) {
                            claim.terminated.push(pid);
                        }
                    }
                    Err(e) => tracing::warn!(
                        port,
                        pid,
                        error = %format_error_chain(&e),
                        "failed to terminate port owner"
                    ),
                }
            }
            claim.remaining = pids;

            // Give the OS time to release the socket.
            tokio::time::sleep(self.release_delay).await;
        }

        match self.find(port).await {
            Ok(pids) => claim.remaining = pids,
            Err(e) => tracing::warn!(port, error = %format_error_chain(&e), "port owner lookup failed"),
        }
        claim
    }
}

/// Port owner discovery via `lsof`/`ss` on Unix and `netstat`/`taskkill` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOwners;

pub fn parse_lsof_pids(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .collect()
}

/// Parses `ss -ltnpH` output: `... users:(("python",pid=1234,fd=3))`.
pub fn parse_ss_pids(text: &str) -> Vec<u32> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut rest = line;
        while let Some(idx) = rest.find("pid=") {
            rest = &rest[idx + 4..];
            let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if let Ok(pid) = rest[..end].parse::<u32>() {
                out.push(pid);
            }
        }
    }
    out
}

/// Parses `netstat -ano -p tcp` output for listeners on `port`.
pub fn parse_netstat_pids(text: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut out = Vec::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("tcp") {
            continue;
        }
        if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("listening") {
            continue;
        }
        if let Ok(pid) = cols[4].parse::<u32>() {
            out.push(pid);
        }
    }
    out
}

#[cfg(unix)]
impl PortOwners for SystemPortOwners {
    fn owners(&self, port: u16) -> anyhow::Result<Vec<u32>> {
        let lsof = std::process::Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .output();
        match lsof {
            // lsof exits 1 when nothing matches.
            Ok(out) => return Ok(parse_lsof_pids(&String::from_utf8_lossy(&out.stdout))),
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).context("run lsof");
            }
            Err(_) => {}
        }

        let out = std::process::Command::new("ss")
            .args(["-ltnpH", &format!("sport = :{port}")])
            .output()
            .context("run ss (lsof not installed)")?;
        Ok(parse_ss_pids(&String::from_utf8_lossy(&out.stdout)))
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        let pid = i32::try_from(pid).context("pid out of range")?;
        // An orphan holding our port gets no grace period.
        let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err).with_context(|| format!("kill {pid}"));
        }
        Ok(())
    }
}

#[cfg(windows)]
impl PortOwners for SystemPortOwners {
    fn owners(&self, port: u16) -> anyhow::Result<Vec<u32>> {
        let out = std::process::Command::new("netstat")
            .args(["-ano", "-p", "tcp"])
            .output()
            .context("run netstat")?;
        Ok(parse_netstat_pids(&String::from_utf8_lossy(&out.stdout), port))
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        let out = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .context("run taskkill")?;
        if !out.status.success() {
            anyhow::bail!(
                "taskkill {pid} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    /// In-memory port table. Terminated pids disappear unless marked sticky.
    #[derive(Debug, Default)]
    pub(crate) struct FakePortOwners {
        pub(crate) bound: Mutex<BTreeMap<u16, Vec<u32>>>,
        pub(crate) sticky: Mutex<BTreeSet<u32>>,
        pub(crate) terminate_calls: Mutex<Vec<u32>>,
        pub(crate) lookups: Mutex<Vec<u16>>,
    }

    impl FakePortOwners {
        pub(crate) fn bind(&self, port: u16, pid: u32) {
            self.bound.lock().unwrap().entry(port).or_default().push(pid);
        }

        pub(crate) fn terminate_calls(&self) -> Vec<u32> {
            self.terminate_calls.lock().unwrap().clone()
        }

        pub(crate) fn lookups(&self) -> Vec<u16> {
            self.lookups.lock().unwrap().clone()
        }
    }

    impl PortOwners for FakePortOwners {
        fn owners(&self, port: u16) -> anyhow::Result<Vec<u32>> {
            self.lookups.lock().unwrap().push(port);
            Ok(self
                .bound
                .lock()
                .unwrap()
                .get(&port)
                .cloned()
                .unwrap_or_default())
        }

        fn terminate(&self, pid: u32) -> anyhow::Result<()> {
            self.terminate_calls.lock().unwrap().push(pid);
            if self.sticky.lock().unwrap().contains(&pid) {
                anyhow::bail!("operation not permitted");
            }
            for pids in self.bound.lock().unwrap().values_mut() {
                pids.retain(|p| *p != pid);
            }
            Ok(())
        }
    }
}
