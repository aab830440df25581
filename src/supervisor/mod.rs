//! Process supervisor for local and repo-backed providers.
//!
//! Keeps at most one live process per entry. Concurrent callers for an entry
//! that is still starting share one start future; the start itself runs as a
//! supervisor-owned task, so a caller giving up on its own deadline never
//! cancels it. Ports come from a bounded pool and are always passed to the
//! process explicitly.

pub mod ports;
pub mod readiness;
pub mod stderr;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Connection, LocalConnection, RegistryEntry, RepoConnection};
use crate::config::{SupervisorConfig, resolve_env_vars};
use crate::error::RelayError;
use crate::repo::RepoFetcher;
use ports::{PortPool, port_is_free};
pub use readiness::{ReadinessProbe, TcpProbe};
use stderr::{StderrBuffer, spawn_drain};

/// Lines of stderr kept per process.
const STDERR_LINES: usize = 100;

/// Where a running provider can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn base_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// Point-in-time view of one supervised process, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub entry_id: String,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

struct Usage {
    active: AtomicUsize,
    last_used: std::sync::Mutex<Instant>,
}

impl Usage {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    fn in_use(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

/// A caller's claim on a running provider. The idle reaper leaves a process
/// alone while any lease on it is alive.
pub struct Lease {
    endpoint: Endpoint,
    usage: Option<Arc<Usage>>,
}

impl Lease {
    fn new(endpoint: Endpoint, usage: Option<Arc<Usage>>) -> Self {
        if let Some(usage) = &usage {
            usage.active.fetch_add(1, Ordering::SeqCst);
            usage.touch();
        }
        Self { endpoint, usage }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(usage) = &self.usage {
            usage.touch();
            usage.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct Running {
    endpoint: Endpoint,
    child: Child,
    pid: Option<u32>,
    usage: Arc<Usage>,
    drain_cancel: CancellationToken,
}

impl Running {
    fn lease(&self) -> Lease {
        Lease::new(self.endpoint.clone(), Some(self.usage.clone()))
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

type SharedStart = Shared<BoxFuture<'static, crate::Result<Endpoint>>>;

enum Slot {
    Starting {
        generation: u64,
        start: SharedStart,
    },
    Ready(Running),
}

/// What to launch for an entry; repo entries are checked out first.
#[derive(Clone)]
struct LaunchPlan {
    launch: LocalConnection,
    repo: Option<RepoConnection>,
}

impl LaunchPlan {
    fn for_entry(entry: &RegistryEntry) -> crate::Result<Self> {
        match entry.connection()? {
            Connection::Local(local) => Ok(Self {
                launch: local.clone(),
                repo: None,
            }),
            Connection::Repo(repo) => Ok(Self {
                launch: repo.launch.clone(),
                repo: Some(repo.clone()),
            }),
            Connection::Remote(_) => Err(RelayError::Validation(
                entry.id.clone(),
                "remote entries are not supervised".to_string(),
            )),
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    ports: PortPool,
    probe: Arc<dyn ReadinessProbe>,
    fetcher: RepoFetcher,
    slots: Mutex<HashMap<String, Slot>>,
    failures: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    next_generation: AtomicU64,
    spawns: AtomicU64,
    closed: AtomicBool,
}

/// Owns every supervised provider process and the port pool.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, probe: Arc<dyn ReadinessProbe>) -> Self {
        let ports = PortPool::new(config.port_range_start, config.port_range_end);
        let fetcher = RepoFetcher::new(config.repo_cache_dir.clone())
            .with_git(config.git_command.clone())
            .with_timeout(config.checkout_timeout());
        Self {
            inner: Arc::new(Inner {
                config,
                ports,
                probe,
                fetcher,
                slots: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                spawns: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Supervisor with the default TCP-connect readiness probe.
    pub fn with_tcp_probe(config: SupervisorConfig) -> Self {
        Self::new(config, Arc::new(TcpProbe::default()))
    }

    /// Return a lease on the entry's running process, starting it if needed.
    ///
    /// Ready: returns immediately. Starting: waits on the in-flight start.
    /// Absent: reserves a port, spawns, and waits for readiness.
    pub async fn ensure_running(&self, entry: &RegistryEntry) -> crate::Result<Lease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RelayError::ProcessSpawn(
                entry.id.clone(),
                "supervisor is shut down".to_string(),
            ));
        }

        let start = {
            let mut slots = self.inner.slots.lock().await;

            let exited = match slots.get_mut(&entry.id) {
                Some(Slot::Ready(running)) => {
                    if !running.has_exited() {
                        return Ok(running.lease());
                    }
                    true
                }
                _ => false,
            };
            if exited {
                if let Some(Slot::Ready(dead)) = slots.remove(&entry.id) {
                    tracing::warn!(entry = %entry.id, "provider exited on its own, restarting");
                    self.stop_running(&entry.id, dead).await;
                }
            }

            match slots.get(&entry.id) {
                Some(Slot::Starting { start, .. }) => start.clone(),
                _ => {
                    let plan = LaunchPlan::for_entry(entry)?;
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let this = self.clone();
                    let entry_id = entry.id.clone();
                    let task =
                        tokio::spawn(async move { this.start(entry_id, plan, generation).await });
                    let id = entry.id.clone();
                    let start: SharedStart = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RelayError::ProcessSpawn(id, format!("start task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    slots.insert(
                        entry.id.clone(),
                        Slot::Starting {
                            generation,
                            start: start.clone(),
                        },
                    );
                    start
                }
            }
        };

        let endpoint = start.await?;
        let slots = self.inner.slots.lock().await;
        let usage = match slots.get(&entry.id) {
            Some(Slot::Ready(running)) if running.endpoint == endpoint => {
                Some(running.usage.clone())
            }
            _ => None,
        };
        Ok(Lease::new(endpoint, usage))
    }

    async fn start(
        self,
        entry_id: String,
        plan: LaunchPlan,
        generation: u64,
    ) -> crate::Result<Endpoint> {
        let outcome = self.launch(&entry_id, &plan).await;

        let mut slots = self.inner.slots.lock().await;
        let still_wanted = matches!(
            slots.get(&entry_id),
            Some(Slot::Starting { generation: g, .. }) if *g == generation
        );
        match outcome {
            Ok(running) if still_wanted => {
                let endpoint = running.endpoint.clone();
                tracing::info!(
                    entry = %entry_id,
                    port = endpoint.port,
                    pid = ?running.pid,
                    "provider ready"
                );
                slots.insert(entry_id.clone(), Slot::Ready(running));
                drop(slots);
                self.inner.failures.lock().await.remove(&entry_id);
                Ok(endpoint)
            }
            Ok(running) => {
                drop(slots);
                tracing::info!(entry = %entry_id, "provider released while starting");
                self.stop_running(&entry_id, running).await;
                Err(RelayError::ProcessSpawn(
                    entry_id,
                    "released while starting".to_string(),
                ))
            }
            Err(e) => {
                if still_wanted {
                    slots.remove(&entry_id);
                }
                drop(slots);
                tracing::warn!(entry = %entry_id, error = %e, "provider failed to start");
                self.inner
                    .failures
                    .lock()
                    .await
                    .insert(entry_id, (e.to_string(), Utc::now()));
                Err(e)
            }
        }
    }

    async fn launch(&self, entry_id: &str, plan: &LaunchPlan) -> crate::Result<Running> {
        let cwd = match &plan.repo {
            Some(repo) => Some(self.inner.fetcher.ensure_checkout(entry_id, repo).await?),
            None => plan.launch.cwd.clone(),
        };

        let host = self.inner.config.host.clone();
        let port = self
            .inner
            .ports
            .acquire_with(|p| port_is_free(&host, p))
            .ok_or_else(|| RelayError::PortExhausted(entry_id.to_string()))?;

        match self
            .spawn_and_wait(entry_id, &plan.launch, cwd.as_deref(), port)
            .await
        {
            Ok(running) => Ok(running),
            Err(e) => {
                self.inner.ports.release(port);
                Err(e)
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        entry_id: &str,
        launch: &LocalConnection,
        cwd: Option<&Path>,
        port: u16,
    ) -> crate::Result<Running> {
        let mut cmd = Command::new(resolve_program(&launch.command, cwd));
        cmd.args(&launch.args);
        if let Some(flag) = &launch.port_arg {
            cmd.arg(flag).arg(port.to_string());
        }
        if !launch.env.is_empty() {
            cmd.envs(resolve_env_vars(&launch.env));
        }
        cmd.env(&launch.port_env, port.to_string());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::ProcessSpawn(entry_id.to_string(), format!("{}: {}", launch.command, e))
        })?;
        self.inner.spawns.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        tracing::info!(entry = %entry_id, port, pid = ?pid, "spawned provider");

        let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(STDERR_LINES)));
        let drain_cancel = CancellationToken::new();
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(
                stderr,
                entry_id.to_string(),
                stderr_buf.clone(),
                drain_cancel.clone(),
            );
        }

        let endpoint = Endpoint {
            host: self.inner.config.host.clone(),
            port,
        };
        let timeout = self.inner.config.readiness_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    // Give the drain a moment to pick up the last lines.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let tail = stderr_buf.lock().await.tail(5);
                    drain_cancel.cancel();
                    return Err(RelayError::ProcessSpawn(
                        entry_id.to_string(),
                        format!("exited with {} before becoming ready: {}", status, tail),
                    ));
                }
                Err(e) => {
                    let _ = child.kill().await;
                    drain_cancel.cancel();
                    return Err(RelayError::ProcessSpawn(entry_id.to_string(), e.to_string()));
                }
            }

            if self.inner.probe.is_ready(&endpoint).await {
                break;
            }

            if Instant::now() >= deadline {
                let _ = child.kill().await;
                let tail = stderr_buf.lock().await.tail(5);
                drain_cancel.cancel();
                tracing::warn!(
                    entry = %entry_id,
                    port,
                    stderr = %tail,
                    "provider not ready in time, killed"
                );
                return Err(RelayError::ReadinessTimeout(
                    entry_id.to_string(),
                    timeout.as_millis() as u64,
                ));
            }

            tokio::time::sleep(self.inner.config.probe_interval()).await;
        }

        Ok(Running {
            endpoint,
            child,
            pid,
            usage: Arc::new(Usage::new()),
            drain_cancel,
        })
    }

    async fn stop_running(&self, entry_id: &str, mut running: Running) {
        running.drain_cancel.cancel();
        let _ = running.child.kill().await;
        self.inner.ports.release(running.endpoint.port);
        tracing::info!(entry = %entry_id, port = running.endpoint.port, "provider stopped");
    }

    /// Stop the entry's process and return its port. Returns false if nothing
    /// was running. A start still in flight is abandoned and cleaned up by its
    /// own task.
    pub async fn release(&self, entry_id: &str) -> bool {
        let slot = self.inner.slots.lock().await.remove(entry_id);
        match slot {
            Some(Slot::Ready(running)) => {
                self.stop_running(entry_id, running).await;
                true
            }
            Some(Slot::Starting { .. }) => {
                tracing::info!(entry = %entry_id, "release requested during start");
                true
            }
            None => false,
        }
    }

    /// One reaper sweep: stops Ready processes idle past `idle_timeout` with
    /// no live lease, and processes that exited on their own.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.inner.config.idle_timeout();
        let victims: Vec<(String, Running)> = {
            let mut slots = self.inner.slots.lock().await;
            let ids: Vec<String> = slots
                .iter_mut()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(running) => {
                        let idle = !running.usage.in_use()
                            && running.usage.idle_for() >= idle_timeout;
                        (running.has_exited() || idle).then(|| id.clone())
                    }
                    Slot::Starting { .. } => None,
                })
                .collect();
            ids.into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(Slot::Ready(running)) => Some((id, running)),
                    _ => None,
                })
                .collect()
        };

        let mut reaped = Vec::with_capacity(victims.len());
        for (id, running) in victims {
            tracing::info!(entry = %id, "reaping idle provider");
            self.stop_running(&id, running).await;
            reaped.push(id);
        }
        reaped
    }

    /// Run `reap_idle` every `reap_interval` until `cancel` fires.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.inner.config.reap_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let reaped = this.reap_idle().await;
                        if !reaped.is_empty() {
                            tracing::debug!(count = reaped.len(), "reaper sweep done");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Stop every process and refuse new starts.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, Slot)> = self.inner.slots.lock().await.drain().collect();
        for (id, slot) in drained {
            if let Slot::Ready(running) = slot {
                self.stop_running(&id, running).await;
            }
        }
        tracing::info!("supervisor shut down");
    }

    pub async fn processes(&self) -> Vec<ProcessInfo> {
        let mut out = Vec::new();
        {
            let mut slots = self.inner.slots.lock().await;
            for (id, slot) in slots.iter_mut() {
                let info = match slot {
                    Slot::Starting { .. } => ProcessInfo {
                        entry_id: id.clone(),
                        state: ProcessState::Starting,
                        pid: None,
                        port: None,
                        idle_secs: None,
                        last_error: None,
                        failed_at: None,
                    },
                    Slot::Ready(running) => ProcessInfo {
                        entry_id: id.clone(),
                        state: if running.has_exited() {
                            ProcessState::Stopped
                        } else {
                            ProcessState::Ready
                        },
                        pid: running.pid,
                        port: Some(running.endpoint.port),
                        idle_secs: Some(running.usage.idle_for().as_secs()),
                        last_error: None,
                        failed_at: None,
                    },
                };
                out.push(info);
            }
        }
        let failures = self.inner.failures.lock().await;
        for (id, (error, at)) in failures.iter() {
            if !out.iter().any(|p| &p.entry_id == id) {
                out.push(ProcessInfo {
                    entry_id: id.clone(),
                    state: ProcessState::Failed,
                    pid: None,
                    port: None,
                    idle_secs: None,
                    last_error: Some(error.clone()),
                    failed_at: Some(*at),
                });
            }
        }
        out.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        out
    }

    /// Number of processes spawned since construction.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    pub fn ports_available(&self) -> usize {
        self.inner.ports.available()
    }

    pub fn ports_total(&self) -> usize {
        self.inner.ports.capacity()
    }

    pub fn repo_fetcher(&self) -> &RepoFetcher {
        &self.inner.fetcher
    }
}

/// Relative commands with a path component run from the provider's cwd.
fn resolve_program(command: &str, cwd: Option<&Path>) -> PathBuf {
    let path = Path::new(command);
    match cwd {
        Some(dir) if path.is_relative() && path.components().count() > 1 => dir.join(path),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessProbe for AlwaysReady {
        async fn is_ready(&self, _endpoint: &Endpoint) -> bool {
            true
        }
    }

    struct ReadyAfter(Duration);

    #[async_trait]
    impl ReadinessProbe for ReadyAfter {
        async fn is_ready(&self, _endpoint: &Endpoint) -> bool {
            tokio::time::sleep(self.0).await;
            true
        }
    }

    struct NeverReady;

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn is_ready(&self, _endpoint: &Endpoint) -> bool {
            false
        }
    }

    fn config(start: u16, end: u16) -> SupervisorConfig {
        SupervisorConfig {
            port_range_start: start,
            port_range_end: end,
            readiness_timeout_ms: 2_000,
            probe_interval_ms: 20,
            ..SupervisorConfig::default()
        }
    }

    fn sleeper(id: &str) -> RegistryEntry {
        RegistryEntry::local(id, "sleep", vec!["30".to_string()])
    }

    #[test]
    fn test_resolve_program() {
        let dir = Path::new("/opt/provider");
        assert_eq!(
            resolve_program("./run.sh", Some(dir)),
            PathBuf::from("/opt/provider/./run.sh")
        );
        assert_eq!(resolve_program("sleep", Some(dir)), PathBuf::from("sleep"));
        assert_eq!(resolve_program("/bin/sh", Some(dir)), PathBuf::from("/bin/sh"));
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let sup = Supervisor::new(
            config(47100, 47109),
            Arc::new(ReadyAfter(Duration::from_millis(200))),
        );
        let entry = sleeper("single-flight");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sup = sup.clone();
            let entry = entry.clone();
            handles.push(tokio::spawn(async move {
                sup.ensure_running(&entry)
                    .await
                    .map(|lease| lease.endpoint().clone())
            }));
        }
        let mut endpoints = Vec::new();
        for handle in handles {
            endpoints.push(handle.await.unwrap().unwrap());
        }

        assert!(endpoints.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(sup.spawn_count(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_and_frees_port() {
        let mut cfg = config(47110, 47112);
        cfg.readiness_timeout_ms = 200;
        let sup = Supervisor::new(cfg, Arc::new(NeverReady));
        let entry = sleeper("slow");

        let result = sup.ensure_running(&entry).await;
        assert!(matches!(result, Err(RelayError::ReadinessTimeout(id, 200)) if id == "slow"));
        assert_eq!(sup.ports_available(), 3);

        let procs = sup.processes().await;
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].state, ProcessState::Failed);

        // The failed handle is gone, so the next call starts again.
        let _ = sup.ensure_running(&entry).await;
        assert_eq!(sup.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_process_exiting_before_ready_is_spawn_error() {
        let sup = Supervisor::new(config(47115, 47116), Arc::new(NeverReady));
        let entry = RegistryEntry::local(
            "crashy",
            "sh",
            vec!["-c".to_string(), "exit 3".to_string()],
        );
        let result = sup.ensure_running(&entry).await;
        assert!(matches!(result, Err(RelayError::ProcessSpawn(id, msg)) if id == "crashy" && msg.contains("before becoming ready")));
        assert_eq!(sup.ports_available(), 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let sup = Supervisor::new(config(47117, 47118), Arc::new(AlwaysReady));
        let entry = RegistryEntry::local("ghost", "/nonexistent/relay-provider", vec![]);
        let result = sup.ensure_running(&entry).await;
        assert!(matches!(result, Err(RelayError::ProcessSpawn(..))));
        assert_eq!(sup.ports_available(), 2);
    }

    #[tokio::test]
    async fn test_released_port_reused_by_other_entry() {
        let sup = Supervisor::new(config(47120, 47120), Arc::new(AlwaysReady));

        let first = sup.ensure_running(&sleeper("first")).await.unwrap();
        let port = first.endpoint().port;
        drop(first);

        let exhausted = sup.ensure_running(&sleeper("second")).await;
        assert!(matches!(exhausted, Err(RelayError::PortExhausted(id)) if id == "second"));

        assert!(sup.release("first").await);
        let second = sup.ensure_running(&sleeper("second")).await.unwrap();
        assert_eq!(second.endpoint().port, port);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_port_and_args_passed_to_process() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(
            config(47125, 47129),
            Arc::new(ReadyAfter(Duration::from_millis(150))),
        );
        let mut entry = RegistryEntry::local(
            "echoer",
            "sh",
            vec![
                "-c".to_string(),
                r#"echo "$PORT $@" > out.txt; exec sleep 30"#.to_string(),
                "sh".to_string(),
            ],
        );
        if let Some(local) = entry.local.as_mut() {
            local.cwd = Some(dir.path().to_path_buf());
            local.port_arg = Some("--port".to_string());
        }

        let lease = sup.ensure_running(&entry).await.unwrap();
        let port = lease.endpoint().port;
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written.trim(), format!("{} --port {}", port, port));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandoned_wait_does_not_cancel_start() {
        let sup = Supervisor::new(
            config(47130, 47131),
            Arc::new(ReadyAfter(Duration::from_millis(300))),
        );
        let entry = sleeper("patient");

        let early = tokio::time::timeout(Duration::from_millis(50), sup.ensure_running(&entry)).await;
        assert!(early.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let procs = sup.processes().await;
        assert_eq!(procs[0].state, ProcessState::Ready);

        sup.ensure_running(&entry).await.unwrap();
        assert_eq!(sup.spawn_count(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_reaper_stops_idle_but_not_leased() {
        let mut cfg = config(47135, 47137);
        cfg.idle_timeout_secs = 0;
        let sup = Supervisor::new(cfg, Arc::new(AlwaysReady));

        let held = sup.ensure_running(&sleeper("busy")).await.unwrap();
        let idle = sup.ensure_running(&sleeper("idle")).await.unwrap();
        drop(idle);

        let reaped = sup.reap_idle().await;
        assert_eq!(reaped, vec!["idle".to_string()]);
        assert_eq!(sup.ports_available(), 2);

        drop(held);
        assert_eq!(sup.reap_idle().await, vec!["busy".to_string()]);
        assert_eq!(sup.ports_available(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_starts() {
        let sup = Supervisor::new(config(47140, 47141), Arc::new(AlwaysReady));
        sup.ensure_running(&sleeper("a")).await.unwrap();
        sup.shutdown().await;
        assert!(sup.processes().await.is_empty());
        assert!(matches!(
            sup.ensure_running(&sleeper("a")).await,
            Err(RelayError::ProcessSpawn(..))
        ));
    }

    #[tokio::test]
    async fn test_hung_checkout_fails_the_start_and_frees_the_slot() {
        use std::os::unix::fs::PermissionsExt;

        let bin = tempfile::tempdir().unwrap();
        let git = bin.path().join("git");
        std::fs::write(&git, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755)).unwrap();
        let cache = tempfile::tempdir().unwrap();

        let mut cfg = config(47150, 47151);
        cfg.git_command = git.display().to_string();
        cfg.checkout_timeout_secs = 1;
        cfg.repo_cache_dir = cache.path().to_path_buf();
        let sup = Supervisor::new(cfg, Arc::new(AlwaysReady));

        let mut entry = sleeper("from-repo");
        entry.kind = crate::catalog::EntryKind::Repo;
        entry.repo = entry.local.take().map(|launch| RepoConnection {
            source: "https://git.example.invalid/acme/intel.git".to_string(),
            git_ref: "main".to_string(),
            subpath: None,
            launch,
        });

        for _ in 0..2 {
            let started = Instant::now();
            let result = sup.ensure_running(&entry).await;
            assert!(
                matches!(result, Err(RelayError::ReadinessTimeout(ref id, 1000)) if id == "from-repo"),
                "{:?}",
                result.map(|lease| lease.endpoint().clone())
            );
            assert!(started.elapsed() < Duration::from_secs(5));
            let processes = sup.processes().await;
            assert_eq!(processes.len(), 1);
            assert_eq!(processes[0].state, ProcessState::Failed);
        }
        assert_eq!(sup.spawn_count(), 0);
        assert_eq!(sup.ports_available(), 2);
    }

    #[tokio::test]
    async fn test_remote_entry_not_supervised() {
        let sup = Supervisor::new(config(47145, 47146), Arc::new(AlwaysReady));
        let entry = RegistryEntry::remote(
            "remote",
            "https://example.com/mcp",
            crate::catalog::ProviderTransport::Mcp,
        );
        assert!(matches!(
            sup.ensure_running(&entry).await,
            Err(RelayError::Validation(..))
        ));
    }
}
