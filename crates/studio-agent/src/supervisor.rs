use std::{
    collections::{BTreeMap, HashMap},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use studio_process::{LogEntry, ProcessState, ProcessStatus, RunId, ServiceId};
use tokio::{
    process::{Child, Command},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};

use crate::error::SupervisorError;
use crate::events::{ControlEvent, EventSink};
use crate::log_router::{LogRouter, ServiceLog};
use crate::port_reclaim::PortReclaimer;
use crate::readiness::{ProbeOutcome, ReadinessProber};
use crate::services::{ReadinessTimeoutPolicy, ServiceSpec};

/// How long to wait for the exit after SIGKILL before giving up on a child.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Bound on draining pipe readers after exit; grandchildren may keep pipes open.
const LOG_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillSignal {
    Terminate,
    Kill,
}

struct RunHandle {
    run_id: RunId,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
    exited: watch::Receiver<bool>,
}

struct ManagedProcess {
    state: ProcessState,
    pid: Option<u32>,
    run_id: Option<RunId>,
    started_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    message: Option<String>,
    run: Option<RunHandle>,
    probe_cancel: Option<watch::Sender<bool>>,
    log: ServiceLog,
}

impl ManagedProcess {
    fn new(log: ServiceLog) -> Self {
        Self {
            state: ProcessState::NotStarted,
            pid: None,
            run_id: None,
            started_at: None,
            exit_code: None,
            message: None,
            run: None,
            probe_cancel: None,
            log,
        }
    }

    fn status(&self, id: ServiceId) -> ProcessStatus {
        ProcessStatus {
            id,
            state: self.state,
            pid: self.pid,
            run_id: self.run_id,
            started_at: self.started_at,
            exit_code: self.exit_code,
            message: self.message.clone(),
        }
    }

    fn owns(&self, run_id: RunId) -> bool {
        self.run_id == Some(run_id)
    }
}

fn not_started(id: ServiceId) -> ProcessStatus {
    ProcessStatus {
        id,
        state: ProcessState::NotStarted,
        pid: None,
        run_id: None,
        started_at: None,
        exit_code: None,
        message: None,
    }
}

struct Inner {
    specs: BTreeMap<ServiceId, ServiceSpec>,
    table: Mutex<HashMap<ServiceId, ManagedProcess>>,
    /// Serializes start/stop per service. Never held while taking another id's lock.
    ops: HashMap<ServiceId, Arc<Mutex<()>>>,
    sink: Arc<dyn EventSink>,
    router: LogRouter,
    reclaimer: PortReclaimer,
    prober: ReadinessProber,
    stop_grace: Duration,
}

impl Inner {
    fn record<'t>(
        &self,
        table: &'t mut HashMap<ServiceId, ManagedProcess>,
        id: ServiceId,
    ) -> &'t mut ManagedProcess {
        table
            .entry(id)
            .or_insert_with(|| ManagedProcess::new(self.router.open(id)))
    }

    fn emit_status(&self, id: ServiceId, rec: &ManagedProcess) {
        self.sink.emit(ControlEvent::ProcessStatus {
            source: id,
            state: rec.state,
            pid: rec.pid,
            exit_code: rec.exit_code,
            message: rec.message.clone(),
        });
    }

    /// Called with the table lock held so status events leave in state order.
    fn transition(
        &self,
        id: ServiceId,
        rec: &mut ManagedProcess,
        state: ProcessState,
        message: Option<String>,
    ) {
        rec.state = state;
        rec.message = message;
        tracing::info!(
            service = %id,
            state = ?state,
            pid = ?rec.pid,
            message = rec.message.as_deref().unwrap_or(""),
            "process state changed"
        );
        self.emit_status(id, rec);
    }
}

/// Owns every child process of the studio. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        specs: BTreeMap<ServiceId, ServiceSpec>,
        sink: Arc<dyn EventSink>,
        router: LogRouter,
        reclaimer: PortReclaimer,
        prober: ReadinessProber,
        stop_grace: Duration,
    ) -> Self {
        let ops = ServiceId::ALL
            .iter()
            .map(|id| (*id, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                specs,
                table: Mutex::new(HashMap::new()),
                ops,
                sink,
                router,
                reclaimer,
                prober,
                stop_grace,
            }),
        }
    }

    fn spec(&self, id: ServiceId) -> Result<ServiceSpec, SupervisorError> {
        self.inner
            .specs
            .get(&id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))
    }

    fn op(&self, id: ServiceId) -> Arc<Mutex<()>> {
        self.inner.ops[&id].clone()
    }

    pub async fn status(&self, id: ServiceId) -> ProcessStatus {
        let table = self.inner.table.lock().await;
        table
            .get(&id)
            .map(|rec| rec.status(id))
            .unwrap_or_else(|| not_started(id))
    }

    pub async fn list(&self) -> Vec<ProcessStatus> {
        let table = self.inner.table.lock().await;
        self.inner
            .specs
            .keys()
            .map(|id| {
                table
                    .get(id)
                    .map(|rec| rec.status(*id))
                    .unwrap_or_else(|| not_started(*id))
            })
            .collect()
    }

    /// Recent output of `id`, see [`crate::log_router::LogBuffer::tail_after`].
    pub async fn tail_logs(&self, id: ServiceId, cursor: u64, limit: usize) -> (Vec<LogEntry>, u64) {
        let log = {
            let table = self.inner.table.lock().await;
            table.get(&id).map(|rec| rec.log.clone())
        };
        match log {
            Some(log) => log.tail(cursor, limit),
            None => (Vec::new(), cursor),
        }
    }

    /// Starts `id` unless it is already starting or running, in which case
    /// the current status is returned untouched.
    pub async fn start(&self, id: ServiceId) -> Result<ProcessStatus, SupervisorError> {
        let spec = self.spec(id)?;
        {
            let table = self.inner.table.lock().await;
            if let Some(rec) = table.get(&id)
                && matches!(rec.state, ProcessState::Starting | ProcessState::Running)
            {
                tracing::warn!(service = %id, state = ?rec.state, "start ignored: already active");
                return Ok(rec.status(id));
            }
        }

        let op = self.op(id);
        let _guard = op.lock().await;
        {
            let table = self.inner.table.lock().await;
            if let Some(rec) = table.get(&id)
                && matches!(rec.state, ProcessState::Starting | ProcessState::Running)
            {
                tracing::warn!(service = %id, state = ?rec.state, "start ignored: already active");
                return Ok(rec.status(id));
            }
        }
        self.launch(id, spec).await
    }

    /// Like [`Supervisor::start`], but waits for an in-flight start to settle
    /// and only succeeds once the service is `Running`.
    pub async fn ensure_running(&self, id: ServiceId) -> Result<ProcessStatus, SupervisorError> {
        let spec = self.spec(id)?;
        let op = self.op(id);
        let mut waited = false;
        loop {
            let guard = op.lock().await;
            let (current, exiting) = {
                let table = self.inner.table.lock().await;
                match table.get(&id) {
                    Some(rec) => (rec.status(id), rec.run.as_ref().map(|r| r.exited.clone())),
                    None => (not_started(id), None),
                }
            };
            if current.state == ProcessState::Running {
                return Ok(current);
            }
            match exiting {
                // A start cancelled by a queued stop leaves its child behind.
                // Give the stop the lock and wait for that child to go away.
                Some(mut exited) if !waited => {
                    drop(guard);
                    waited = true;
                    tracing::debug!(service = %id, state = ?current.state, "waiting for previous run to exit");
                    wait_exit(&mut exited, self.inner.stop_grace + KILL_WAIT).await;
                }
                _ => return self.launch(id, spec).await,
            }
        }
    }

    pub async fn toggle(&self, id: ServiceId) -> Result<ProcessStatus, SupervisorError> {
        let current = self.status(id).await;
        if matches!(current.state, ProcessState::Starting | ProcessState::Running) {
            self.stop(id).await
        } else {
            self.start(id).await
        }
    }

    async fn launch(&self, id: ServiceId, spec: ServiceSpec) -> Result<ProcessStatus, SupervisorError> {
        let inner = &self.inner;
        let run_id = RunId::new();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let log = {
            let mut table = inner.table.lock().await;
            let rec = inner.record(&mut table, id);
            if rec.run.is_some() {
                return Err(SupervisorError::Spawn {
                    service: id,
                    message: "previous instance is still exiting".to_string(),
                });
            }
            rec.pid = None;
            rec.exit_code = None;
            rec.started_at = None;
            rec.run_id = Some(run_id);
            rec.probe_cancel = Some(cancel_tx);
            inner.transition(id, rec, ProcessState::Starting, Some("starting".to_string()));
            rec.log.clone()
        };

        let mut conflict = None;
        if let Some(port) = spec.port {
            let claim = inner.reclaimer.reclaim(port).await;
            if !claim.terminated.is_empty() {
                log.note(format!(
                    "terminated stale owner(s) of port {port}: {:?}",
                    claim.terminated
                ));
            }
            conflict = claim.conflict();
            if let Some(c) = &conflict {
                log.note_error(c.to_string());
            }
        }

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut message = format!(
                    "{} (cwd {}): {e}",
                    spec.command,
                    spec.working_dir.display()
                );
                if let Some(c) = conflict {
                    message.push_str(&format!("; {c}"));
                }
                log.note_error(format!("spawn failed: {message}"));
                let mut table = inner.table.lock().await;
                let rec = inner.record(&mut table, id);
                if rec.owns(run_id) {
                    rec.probe_cancel = None;
                    inner.transition(id, rec, ProcessState::Failed, Some(message.clone()));
                }
                return Err(SupervisorError::Spawn {
                    service: id,
                    message,
                });
            }
        };

        let pid = child.id();
        let pumps = inner.router.attach(
            &log,
            child.stdout.take(),
            child.stderr.take(),
            &spec.stderr,
        );
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let mut table = inner.table.lock().await;
            let rec = inner.record(&mut table, id);
            rec.pid = pid;
            rec.started_at = Some(Utc::now());
            rec.run = Some(RunHandle {
                run_id,
                kill_tx,
                exited: exit_rx,
            });
            let message = Some(format!("spawned pid {}", pid.unwrap_or_default()));
            inner.transition(id, rec, ProcessState::Starting, message);
        }
        log.note(format!(
            "spawned: {} {} (pid {})",
            spec.command,
            spec.args.join(" "),
            pid.unwrap_or_default()
        ));

        tokio::spawn(watch_exit(
            self.inner.clone(),
            id,
            run_id,
            child,
            pid,
            kill_rx,
            exit_tx,
            pumps,
        ));

        let Some(check) = spec.readiness.clone() else {
            return self.settle(id, run_id, "running".to_string()).await;
        };

        log.note(format!(
            "waiting for {} (max {} attempts)",
            check.url, check.max_attempts
        ));
        match inner.prober.wait_ready(&check, &mut cancel_rx).await {
            ProbeOutcome::Ready { attempts } => {
                log.note(format!("ready after {attempts} attempt(s)"));
                self.settle(id, run_id, "running".to_string()).await
            }
            ProbeOutcome::Cancelled { .. } => {
                let table = inner.table.lock().await;
                match table.get(&id) {
                    Some(rec) if rec.owns(run_id) && rec.state == ProcessState::Stopped => {
                        Ok(rec.status(id))
                    }
                    Some(rec) if rec.owns(run_id) && rec.state == ProcessState::Failed => {
                        Err(exited_early(id, rec))
                    }
                    _ => Err(SupervisorError::Cancelled { service: id }),
                }
            }
            ProbeOutcome::Exhausted {
                attempts,
                last_error,
            } => match spec.on_readiness_timeout {
                ReadinessTimeoutPolicy::Degrade => {
                    log.note_error(format!(
                        "readiness not confirmed after {attempts} attempts ({last_error}); leaving it running"
                    ));
                    self.settle(
                        id,
                        run_id,
                        format!("running (readiness not confirmed: {last_error})"),
                    )
                    .await
                }
                ReadinessTimeoutPolicy::Fail => {
                    let err = SupervisorError::ReadinessTimeout {
                        service: id,
                        attempts,
                        last_error,
                    };
                    log.note_error(err.to_string());
                    let run = {
                        let mut table = inner.table.lock().await;
                        let rec = inner.record(&mut table, id);
                        if rec.owns(run_id) && rec.state == ProcessState::Starting {
                            rec.probe_cancel = None;
                            inner.transition(id, rec, ProcessState::Failed, Some(err.to_string()));
                            rec.run
                                .as_ref()
                                .map(|r| (r.kill_tx.clone(), r.exited.clone()))
                        } else {
                            None
                        }
                    };
                    if let Some((kill_tx, mut exited)) = run {
                        let _ = kill_tx.send(KillSignal::Kill);
                        wait_exit(&mut exited, KILL_WAIT).await;
                    }
                    Err(err)
                }
            },
        }
    }

    /// Promotes a still-starting run to `Running`.
    async fn settle(
        &self,
        id: ServiceId,
        run_id: RunId,
        message: String,
    ) -> Result<ProcessStatus, SupervisorError> {
        let inner = &self.inner;
        let mut table = inner.table.lock().await;
        let rec = inner.record(&mut table, id);
        if !rec.owns(run_id) {
            return Err(SupervisorError::Cancelled { service: id });
        }
        match rec.state {
            ProcessState::Starting => {
                rec.probe_cancel = None;
                inner.transition(id, rec, ProcessState::Running, Some(message));
                Ok(rec.status(id))
            }
            // Clean exit before we got here.
            ProcessState::Running | ProcessState::Stopped => Ok(rec.status(id)),
            ProcessState::Failed => Err(exited_early(id, rec)),
            _ => Err(SupervisorError::Cancelled { service: id }),
        }
    }

    /// Stops `id` if it is starting or running: SIGTERM to the process
    /// group, then SIGKILL once the grace period runs out.
    pub async fn stop(&self, id: ServiceId) -> Result<ProcessStatus, SupervisorError> {
        self.spec(id)?;
        let inner = &self.inner;

        // Let a pending readiness wait give up the op lock.
        {
            let table = inner.table.lock().await;
            if let Some(tx) = table.get(&id).and_then(|rec| rec.probe_cancel.as_ref()) {
                let _ = tx.send(true);
            }
        }

        let op = self.op(id);
        let _guard = op.lock().await;

        let (run_id, kill_tx, mut exited, log) = {
            let mut table = inner.table.lock().await;
            let Some(rec) = table.get_mut(&id) else {
                return Ok(not_started(id));
            };
            if !matches!(rec.state, ProcessState::Starting | ProcessState::Running) {
                return Ok(rec.status(id));
            }
            let Some(run) = rec.run.as_ref() else {
                return Ok(rec.status(id));
            };
            let handles = (
                run.run_id,
                run.kill_tx.clone(),
                run.exited.clone(),
                rec.log.clone(),
            );
            rec.probe_cancel = None;
            inner.transition(id, rec, ProcessState::Stopping, Some("stopping".to_string()));
            handles
        };

        log.note(format!(
            "stop requested (grace_ms={})",
            inner.stop_grace.as_millis()
        ));
        let _ = kill_tx.send(KillSignal::Terminate);

        if !wait_exit(&mut exited, inner.stop_grace).await {
            log.note("stop: grace period elapsed, sending SIGKILL");
            let _ = kill_tx.send(KillSignal::Kill);
            if !wait_exit(&mut exited, KILL_WAIT).await {
                let mut table = inner.table.lock().await;
                let rec = inner.record(&mut table, id);
                if rec.run.as_ref().is_some_and(|r| r.run_id == run_id) {
                    rec.run = None;
                    rec.pid = None;
                    inner.transition(
                        id,
                        rec,
                        ProcessState::Failed,
                        Some("did not exit after SIGKILL".to_string()),
                    );
                }
            }
        }

        Ok(self.status(id).await)
    }

    /// Stops everything, bounded by `timeout`; stragglers are killed outright.
    pub async fn shutdown(&self, timeout: Duration) {
        let ids: Vec<ServiceId> = self.inner.specs.keys().copied().collect();
        let stops = ids.iter().map(|id| self.stop(*id));
        if tokio::time::timeout(timeout, join_all(stops)).await.is_err() {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "shutdown timed out; killing remaining processes"
            );
            let table = self.inner.table.lock().await;
            for (id, rec) in table.iter() {
                if let Some(run) = &rec.run {
                    tracing::warn!(service = %id, pid = ?rec.pid, "force kill");
                    let _ = run.kill_tx.send(KillSignal::Kill);
                    force_kill(rec.pid);
                }
            }
        }
    }
}

fn exited_early(id: ServiceId, rec: &ManagedProcess) -> SupervisorError {
    SupervisorError::CrashExit {
        service: id,
        code: rec.exit_code,
        message: rec
            .message
            .clone()
            .unwrap_or_else(|| "exited before becoming ready".to_string()),
    }
}

/// True if the run exited within `timeout`.
async fn wait_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
        Ok(Ok(_)) => true,
        // Watcher is gone, so the child has been reaped.
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("terminated by signal {sig}");
        }
    }
    "exited abnormally".to_string()
}

#[allow(clippy::too_many_arguments)]
async fn watch_exit(
    inner: Arc<Inner>,
    id: ServiceId,
    run_id: RunId,
    mut child: Child,
    pid: Option<u32>,
    mut kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    exit_tx: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
) {
    let res = loop {
        tokio::select! {
            res = child.wait() => break res,
            Some(sig) = kill_rx.recv() => signal_child(&mut child, pid, sig).await,
        }
    };

    // Output written just before exit should precede the exit status.
    let _ = tokio::time::timeout(LOG_DRAIN, join_all(pumps)).await;

    {
        let mut table = inner.table.lock().await;
        if let Some(rec) = table.get_mut(&id)
            && rec.run.as_ref().is_some_and(|r| r.run_id == run_id)
        {
            rec.run = None;
            rec.pid = None;
            if let Some(tx) = rec.probe_cancel.take() {
                let _ = tx.send(true);
            }
            if let Ok(status) = &res {
                rec.exit_code = status.code();
            }

            let next = match (rec.state, &res) {
                (ProcessState::Stopping, _) => Some((ProcessState::Stopped, "stopped".to_string())),
                (ProcessState::Starting | ProcessState::Running, Ok(status)) if status.success() => {
                    Some((ProcessState::Stopped, "exited".to_string()))
                }
                (ProcessState::Starting | ProcessState::Running, Ok(status)) => {
                    Some((ProcessState::Failed, describe_exit(status)))
                }
                (ProcessState::Starting | ProcessState::Running, Err(e)) => {
                    Some((ProcessState::Failed, format!("wait failed: {e}")))
                }
                _ => None,
            };

            let line = format!(
                "process exited: state={:?} exit_code={:?}",
                next.as_ref().map(|(s, _)| *s).unwrap_or(rec.state),
                rec.exit_code
            );
            if matches!(next, Some((ProcessState::Failed, _))) {
                rec.log.note_error(line);
            } else {
                rec.log.note(line);
            }

            match next {
                Some((state, message)) => inner.transition(id, rec, state, Some(message)),
                None => inner.emit_status(id, rec),
            }
        }
    }

    let _ = exit_tx.send(true);
}

#[cfg(unix)]
async fn signal_child(child: &mut Child, pid: Option<u32>, sig: KillSignal) {
    let signo = match sig {
        KillSignal::Terminate => libc::SIGTERM,
        KillSignal::Kill => libc::SIGKILL,
    };
    if let Some(pid) = pid {
        // The child called setsid(), so its pid is also its process group id.
        let rc = unsafe { libc::kill(-(pid as i32), signo) };
        if rc == 0 {
            return;
        }
        let rc = unsafe { libc::kill(pid as i32, signo) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
async fn signal_child(child: &mut Child, pid: Option<u32>, _sig: KillSignal) {
    // No polite console signal for windowless children; take the tree down.
    #[cfg(windows)]
    {
        if let Some(pid) = pid {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }
    #[cfg(not(windows))]
    let _ = pid;
    let _ = child.start_kill();
}

fn force_kill(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children get SIGTERM if the orchestrator dies without cleaning up.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
