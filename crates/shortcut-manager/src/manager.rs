//! Launch, kill and track shortcuts.
//!
//! Per shortcut id the manager moves through `Idle → Launching → Running →
//! Idle`. The [`RunStateTable`] is the only record of what is running, and only
//! this module writes to it. A run ends when either an exit watcher or an
//! explicit kill removes its entry; whichever does so first publishes the one
//! stop event for that run.

use crate::broadcast::{Event, EventBroadcaster, EventKind, Subscription};
use crate::config::EngineConfig;
use crate::hooks::{HookEngine, HookPlan};
use crate::lifecycle::{AppLifecycle, HostAppSignals};
use crate::notify::{LogNotifier, Notifier};
use crate::process::{self, CommandRunner, ExitSignal, ProcessHandle, UNKNOWN_STATUS};
use crate::shortcut::{Shortcut, ShortcutsDictionary};
use crate::state::{RunStateEntry, RunStateTable};
use crate::store::SettingsStore;
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settings key under which the pids of running shortcuts are recorded
pub const RUNNING_PIDS_KEY: &str = "runningPids";

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_ADOPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a run needs once it stops
#[derive(Debug)]
struct RunContext {
    plan: HookPlan,
    env: Vec<(String, String)>,
    /// Task waiting for the run's exit signal, aborted when the run is killed
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    runner: CommandRunner,
    hooks: HookEngine,
    table: RunStateTable,
    broadcaster: EventBroadcaster,
    notifier: Arc<dyn Notifier>,
    lifecycle: Arc<dyn AppLifecycle>,
    settings: Option<Arc<dyn SettingsStore>>,
    launching: Mutex<HashSet<String>>,
    contexts: Mutex<HashMap<u64, RunContext>>,
    /// Serializes snapshots of the table with their write to settings
    record_lock: Mutex<()>,
    next_run: AtomicU64,
    kill_grace: Duration,
    adopt_poll_interval: Duration,
}

/// Orchestrates launches, kills and run-state queries. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

/// Builder for [`ExecutionManager`]
pub struct ExecutionManagerBuilder {
    runner: CommandRunner,
    hooks: HookEngine,
    notifier: Arc<dyn Notifier>,
    lifecycle: Arc<dyn AppLifecycle>,
    settings: Option<Arc<dyn SettingsStore>>,
    kill_grace: Duration,
    adopt_poll_interval: Duration,
}

impl Default for ExecutionManagerBuilder {
    fn default() -> Self {
        Self {
            runner: CommandRunner::default(),
            hooks: HookEngine::default(),
            notifier: Arc::new(LogNotifier),
            lifecycle: Arc::new(HostAppSignals::new()),
            settings: None,
            kill_grace: DEFAULT_KILL_GRACE,
            adopt_poll_interval: DEFAULT_ADOPT_POLL_INTERVAL,
        }
    }
}

impl ExecutionManagerBuilder {
    /// Set the command runner
    pub fn runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Set the hook engine
    pub fn hooks(mut self, hooks: HookEngine) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the sink for user-visible failure messages
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the source of "app ended" signals
    pub fn lifecycle(mut self, lifecycle: Arc<dyn AppLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Record running pids in this store so a later instance can adopt them
    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// How long a killed process group gets before SIGKILL
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// How often adopted processes are probed
    pub fn adopt_poll_interval(mut self, interval: Duration) -> Self {
        self.adopt_poll_interval = interval;
        self
    }

    pub fn build(self) -> ExecutionManager {
        ExecutionManager {
            inner: Arc::new(Inner {
                runner: self.runner,
                hooks: self.hooks,
                table: RunStateTable::new(),
                broadcaster: EventBroadcaster::new(),
                notifier: self.notifier,
                lifecycle: self.lifecycle,
                settings: self.settings,
                launching: Mutex::new(HashSet::new()),
                contexts: Mutex::new(HashMap::new()),
                record_lock: Mutex::new(()),
                next_run: AtomicU64::new(1),
                kill_grace: self.kill_grace,
                adopt_poll_interval: self.adopt_poll_interval,
            }),
        }
    }
}

/// Holds a shortcut id in the launching set until dropped
struct Reservation<'a> {
    launching: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.launching.lock().remove(&self.id);
    }
}

impl ExecutionManager {
    pub fn builder() -> ExecutionManagerBuilder {
        ExecutionManagerBuilder::default()
    }

    /// A builder with runner, hooks and timings taken from `config`
    pub fn builder_from_config(config: &EngineConfig) -> ExecutionManagerBuilder {
        Self::builder()
            .runner(CommandRunner::new(&config.shell).with_log_dir(config.log_dir.clone()))
            .hooks(
                HookEngine::new(config.hooks.clone())
                    .with_shell(&config.shell)
                    .with_timeout(config.hook_timeout()),
            )
            .adopt_poll_interval(config.adopt_poll_interval())
    }

    pub fn hooks(&self) -> &HookEngine {
        &self.inner.hooks
    }

    /// Launch a shortcut, reporting failure as `false` and a toast
    pub async fn launch_shortcut(&self, shortcut: &Shortcut) -> bool {
        self.launch_shortcut_with_flags(shortcut, &[]).await
    }

    /// Like [`launch_shortcut`](Self::launch_shortcut), appending `-flag value` pairs
    pub async fn launch_shortcut_with_flags(
        &self,
        shortcut: &Shortcut,
        flags: &[(String, String)],
    ) -> bool {
        self.launch_or_toast(shortcut, flags).await.is_ok()
    }

    /// Kill a shortcut, reporting failure as `false` and a toast
    pub async fn kill_shortcut(&self, id: &str) -> bool {
        self.kill_or_toast(id).await.is_ok()
    }

    /// [`launch_with_flags`](Self::launch_with_flags), toasting failures other than
    /// [`Error::AlreadyRunning`]
    pub async fn launch_or_toast(
        &self,
        shortcut: &Shortcut,
        flags: &[(String, String)],
    ) -> Result<ProcessHandle> {
        let result = self.launch_with_flags(shortcut, flags).await;
        match &result {
            Ok(_) => {}
            Err(Error::AlreadyRunning(id)) => {
                debug!("Launch of {} ignored, already running", id);
            }
            Err(e) => {
                error!("Shortcut {} failed to launch: {}", shortcut.id, e);
                self.toast("Error", "Shortcut failed. Check the command.");
            }
        }
        result
    }

    /// [`kill`](Self::kill), toasting any failure
    pub async fn kill_or_toast(&self, id: &str) -> Result<()> {
        let result = self.kill(id).await;
        if let Err(e) = &result {
            warn!("Failed to kill shortcut {}: {}", id, e);
            self.toast("Error", "Failed to kill shortcut.");
        }
        result
    }

    /// Launch a shortcut
    pub async fn launch(&self, shortcut: &Shortcut) -> Result<ProcessHandle> {
        self.launch_with_flags(shortcut, &[]).await
    }

    /// Launch a shortcut with `-flag value` pairs appended to its command line.
    /// App shortcuts take no flags.
    ///
    /// Resolves and runs pre hooks, spawns the command, records it as running
    /// and publishes `started`. On hook or spawn failure nothing is recorded and
    /// `launch_failed` is published. An empty command is rejected up front
    /// without any event.
    pub async fn launch_with_flags(
        &self,
        shortcut: &Shortcut,
        flags: &[(String, String)],
    ) -> Result<ProcessHandle> {
        let id = shortcut.id.as_str();
        if shortcut.cmd.trim().is_empty() {
            return Err(Error::Spawn(format!("Shortcut {id} has an empty command")));
        }

        let _reservation = self.reserve(id)?;
        info!("Launching shortcut {} ({})", id, shortcut.name);

        let env = shortcut_env(shortcut);
        let cmd = if shortcut.is_app {
            if !flags.is_empty() {
                debug!("Ignoring launch flags for app shortcut {}", id);
            }
            shortcut.cmd.clone()
        } else {
            command_line(&shortcut.cmd, flags)
        };
        let started = async {
            let plan = self.inner.hooks.resolve(&shortcut.hooks)?;
            self.inner.hooks.run_pre(&plan, &env).await?;
            let (handle, exit) = self.inner.runner.start(&cmd, &env, Some(id))?;
            Ok::<_, Error>((plan, handle, exit))
        }
        .await;

        let (plan, handle, exit) = match started {
            Ok(started) => started,
            Err(e) => {
                warn!("Launch of {} failed: {}", id, e);
                self.publish(Event::new(
                    id,
                    EventKind::LaunchFailed {
                        reason: e.to_string(),
                    },
                ));
                return Err(e);
            }
        };

        // App shortcuts end when the host says so; their own process exit is ignored.
        let signal = if shortcut.is_app {
            self.inner.lifecycle.watch(id)
        } else {
            exit
        };

        let run = self.inner.next_run.fetch_add(1, Ordering::SeqCst);
        self.inner
            .contexts
            .lock()
            .insert(run, RunContext {
                plan,
                env,
                watcher: None,
            });
        self.inner.table.set(
            id,
            RunStateEntry {
                shortcut_id: id.to_string(),
                process_handle: handle,
                started_at: Utc::now(),
                run,
                adopted: false,
            },
        );
        self.record_running();
        self.publish(Event::new(id, EventKind::Started { pid: handle.pid() }));

        let watcher = self.spawn_exit_watcher(id.to_string(), run, handle, signal, shortcut.is_app);
        if let Some(context) = self.inner.contexts.lock().get_mut(&run) {
            context.watcher = Some(watcher);
        }
        Ok(handle)
    }

    /// Stop a running shortcut.
    ///
    /// Claims the run, signals its process group, runs post hooks and publishes
    /// `killed`. A run whose exit was observed first is left to its exit
    /// watcher. The run is cleared even if signalling fails; the failure is
    /// still returned. A shortcut that is not running yields
    /// [`Error::NotRunning`].
    pub async fn kill(&self, id: &str) -> Result<()> {
        let entry = self
            .inner
            .table
            .get(id)
            .ok_or_else(|| Error::NotRunning(id.to_string()))?;
        let Some((entry, context)) = self.stop(id, entry.run) else {
            return Err(Error::NotRunning(id.to_string()));
        };
        if let Some(watcher) = context.as_ref().and_then(|c| c.watcher.as_ref()) {
            watcher.abort();
        }

        info!("Killing shortcut {} (pid {})", id, entry.process_handle.pid());
        let signalled = self
            .inner
            .runner
            .terminate(entry.process_handle, self.inner.kill_grace);

        self.complete(id, &entry, context, EventKind::Killed).await;

        match signalled {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::NotRunning(id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Whether a shortcut is currently running
    pub fn is_running(&self, id: &str) -> bool {
        self.inner.table.contains(id)
    }

    /// Ids of all running shortcuts
    pub fn running(&self) -> BTreeSet<String> {
        self.inner.table.snapshot()
    }

    /// The run-state entry of a shortcut, if it is running
    pub fn entry(&self, id: &str) -> Option<RunStateEntry> {
        self.inner.table.get(id)
    }

    /// Receive the lifecycle events of a shortcut
    pub fn subscribe(&self, id: &str) -> Subscription {
        self.inner.broadcaster.subscribe(id)
    }

    /// Run `callback` for each lifecycle event of a shortcut
    pub fn on_event<F>(&self, id: &str, callback: F) -> JoinHandle<()>
    where
        F: Fn(&Event) + Send + 'static,
    {
        self.inner.broadcaster.on_event(id, callback)
    }

    /// Drop all subscribers of a shortcut
    pub fn unsubscribe(&self, id: &str) -> usize {
        self.inner.broadcaster.unsubscribe(id)
    }

    /// Adopt processes recorded by a previous engine instance.
    ///
    /// Reads the recorded pids, keeps those whose shortcut still exists and
    /// whose process is alive, and tracks them as running. Adopted runs are
    /// polled for liveness and end with status [`UNKNOWN_STATUS`]. Returns the
    /// adopted ids.
    pub fn reconcile(&self, shortcuts: &ShortcutsDictionary) -> Result<Vec<String>> {
        let Some(settings) = &self.inner.settings else {
            return Ok(Vec::new());
        };
        let record = settings.get_setting(RUNNING_PIDS_KEY, serde_json::json!({}))?;
        let pids: BTreeMap<String, u32> = serde_json::from_value(record).unwrap_or_else(|e| {
            warn!("Ignoring malformed {} record: {}", RUNNING_PIDS_KEY, e);
            BTreeMap::new()
        });

        let mut adopted = Vec::new();
        for (id, pid) in pids {
            let Some(shortcut) = shortcuts.get(&id) else {
                debug!("Dropping pid record for removed shortcut {}", id);
                continue;
            };
            if self.inner.table.contains(&id) {
                continue;
            }
            if !process::is_alive(pid) {
                info!("Recorded process {} for {} is gone", pid, id);
                continue;
            }

            let plan = self.inner.hooks.resolve(&shortcut.hooks).unwrap_or_else(|e| {
                warn!("Adopting {} without post hooks: {}", id, e);
                HookPlan::default()
            });
            let run = self.inner.next_run.fetch_add(1, Ordering::SeqCst);
            self.inner.contexts.lock().insert(
                run,
                RunContext {
                    plan,
                    env: shortcut_env(shortcut),
                    watcher: None,
                },
            );
            self.inner.table.set(
                &id,
                RunStateEntry {
                    shortcut_id: id.clone(),
                    process_handle: ProcessHandle::from_pid(pid),
                    started_at: Utc::now(),
                    run,
                    adopted: true,
                },
            );
            info!("Adopted running shortcut {} (pid {})", id, pid);
            self.spawn_liveness_poller(id.clone(), run, pid);
            adopted.push(id);
        }

        self.record_running();
        Ok(adopted)
    }

    fn reserve(&self, id: &str) -> Result<Reservation<'_>> {
        let mut launching = self.inner.launching.lock();
        if self.inner.table.contains(id) || !launching.insert(id.to_string()) {
            return Err(Error::AlreadyRunning(id.to_string()));
        }
        Ok(Reservation {
            launching: &self.inner.launching,
            id: id.to_string(),
        })
    }

    fn spawn_exit_watcher(
        &self,
        id: String,
        run: u64,
        handle: ProcessHandle,
        signal: ExitSignal,
        is_app: bool,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let status = match signal.wait().await {
                Some(status) => status,
                None => {
                    warn!("Exit signal for {} was dropped", id);
                    UNKNOWN_STATUS
                }
            };
            debug!("Run {} of {} ended with status {}", run, id, status);
            if is_app && manager.inner.table.get(&id).is_some_and(|e| e.run == run) {
                // The launcher's process group may still be around after the app closed
                if let Err(e) = manager.inner.runner.kill(handle) {
                    debug!("Could not clean up process group of {}: {}", id, e);
                }
            }
            manager.finish(&id, run, EventKind::End { status }).await;
        })
    }

    fn spawn_liveness_poller(&self, id: String, run: u64, pid: u32) {
        let manager = self.clone();
        let interval = self.inner.adopt_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let current = manager.inner.table.get(&id).is_some_and(|e| e.run == run);
                if !current {
                    return;
                }
                if !process::is_alive(pid) {
                    manager
                        .finish(&id, run, EventKind::End {
                            status: UNKNOWN_STATUS,
                        })
                        .await;
                    return;
                }
            }
        });
    }

    /// End a run if it is still current; only the caller that removes the entry proceeds
    async fn finish(&self, id: &str, run: u64, kind: EventKind) -> bool {
        let Some((entry, context)) = self.stop(id, run) else {
            return false;
        };
        self.complete(id, &entry, context, kind).await;
        true
    }

    /// Remove a run from the table, making the caller the owner of its stop event
    fn stop(&self, id: &str, run: u64) -> Option<(RunStateEntry, Option<RunContext>)> {
        let Some(entry) = self.inner.table.take_run(id, run) else {
            debug!("Run {} of {} was already stopped", run, id);
            return None;
        };
        let context = self.inner.contexts.lock().remove(&run);
        self.record_running();
        Some((entry, context))
    }

    async fn complete(
        &self,
        id: &str,
        entry: &RunStateEntry,
        context: Option<RunContext>,
        kind: EventKind,
    ) {
        info!(
            "Shortcut {} stopped (pid {}): {:?}",
            id,
            entry.process_handle.pid(),
            kind
        );

        if let Some(context) = context {
            let failed = self.inner.hooks.run_post(&context.plan, &context.env).await;
            if failed > 0 {
                warn!("{} post hook action(s) failed for {}", failed, id);
            }
        }

        self.publish(Event::new(id, kind));
    }

    fn publish(&self, event: Event) {
        let delivered = self.inner.broadcaster.publish(&event);
        debug!("Event {:?} delivered to {} subscriber(s)", event, delivered);
    }

    fn toast(&self, title: &str, message: &str) {
        if let Err(e) = self.inner.notifier.toast(title, message) {
            error!("Toaster error: {}", e);
        }
    }

    /// Best-effort write of the running pids for a later [`reconcile`](Self::reconcile)
    fn record_running(&self) {
        let Some(settings) = &self.inner.settings else {
            return;
        };
        let _guard = self.inner.record_lock.lock();
        let pids: BTreeMap<String, u32> = self
            .inner
            .table
            .entries()
            .into_iter()
            .map(|e| (e.shortcut_id, e.process_handle.pid()))
            .collect();
        let value = match serde_json::to_value(pids) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode running pids: {}", e);
                return;
            }
        };
        if let Err(e) = settings.set_setting(RUNNING_PIDS_KEY, value) {
            warn!("Failed to record running pids: {}", e);
        }
    }
}

/// Environment passed to a shortcut's process and hook actions
fn shortcut_env(shortcut: &Shortcut) -> Vec<(String, String)> {
    vec![
        ("SHORTCUT_ID".to_string(), shortcut.id.clone()),
        ("SHORTCUT_NAME".to_string(), shortcut.name.clone()),
    ]
}

/// Append `-flag 'value'` pairs to a command line
fn command_line(cmd: &str, flags: &[(String, String)]) -> String {
    let mut line = cmd.to_string();
    for (flag, value) in flags {
        line.push(' ');
        line.push_str(&shell_words::quote(&format!("-{flag}")));
        line.push(' ');
        line.push_str(&shell_words::quote(value));
    }
    line
}
