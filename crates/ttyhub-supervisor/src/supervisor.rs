use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ttyhub_protocol::{ProgramConfig, ProgramInfo, ProgramStatus, StopMethod};

use crate::error::SupervisorError;
use crate::procscan::ProcessBackend;
use crate::screen::ScreenControl;
use crate::store::ProgramStore;

/// Wait between asking a program to stop and checking whether it did.
pub const STOP_GRACE_DELAY: Duration = Duration::from_secs(1);
/// Cadence of the background liveness pass.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(3);

struct ProgramEntry {
    config: ProgramConfig,
    pid: Option<u32>,
    status: ProgramStatus,
    screen_active: bool,
}

impl ProgramEntry {
    fn new(config: ProgramConfig) -> Self {
        Self {
            config,
            pid: None,
            status: ProgramStatus::Stopped,
            screen_active: false,
        }
    }

    fn to_info(&self) -> ProgramInfo {
        ProgramInfo {
            config: self.config.clone(),
            pid: self.pid,
            status: self.status,
            screen_active: self.screen_active,
        }
    }
}

/// Keeps long-running programs alive inside external multiplexer sessions.
///
/// Per program the state machine is `stopped → running → (stopped | error)`.
/// Every observed transition is pushed on the status channel, which the
/// server fans out to viewers. Definitions persist to the program store on
/// every mutation; runtime fields never do.
pub struct Supervisor<S: ScreenControl> {
    store: ProgramStore,
    screen: S,
    backend: Box<dyn ProcessBackend>,
    programs: Mutex<Vec<ProgramEntry>>,
    status_tx: mpsc::UnboundedSender<ProgramInfo>,
}

impl<S: ScreenControl> Supervisor<S> {
    pub fn new(
        store: ProgramStore,
        screen: S,
        backend: Box<dyn ProcessBackend>,
        status_tx: mpsc::UnboundedSender<ProgramInfo>,
    ) -> Result<Self, SupervisorError> {
        let configs = store.load()?;
        info!(programs = configs.len(), "loaded program definitions");
        Ok(Self {
            store,
            screen,
            backend,
            programs: Mutex::new(configs.into_iter().map(ProgramEntry::new).collect()),
            status_tx,
        })
    }

    pub async fn list(&self) -> Vec<ProgramInfo> {
        let programs = self.programs.lock().await;
        programs.iter().map(ProgramEntry::to_info).collect()
    }

    pub async fn get(&self, id: u64) -> Result<ProgramInfo, SupervisorError> {
        let programs = self.programs.lock().await;
        programs
            .iter()
            .find(|e| e.config.id == id)
            .map(ProgramEntry::to_info)
            .ok_or(SupervisorError::ProgramNotFound(id))
    }

    /// Register a new program definition. The id is assigned here; whatever
    /// the caller sent is ignored.
    pub async fn add(&self, mut config: ProgramConfig) -> Result<ProgramInfo, SupervisorError> {
        let mut programs = self.programs.lock().await;
        config.id = programs.iter().map(|e| e.config.id).max().unwrap_or(0) + 1;
        info!(program_id = config.id, name = %config.name, "program added");
        let entry = ProgramEntry::new(config);
        let info = entry.to_info();
        programs.push(entry);
        self.persist(&programs)?;
        Ok(info)
    }

    /// Replace a program's definition, keeping its runtime state.
    pub async fn update(&self, config: ProgramConfig) -> Result<ProgramInfo, SupervisorError> {
        let mut programs = self.programs.lock().await;
        let entry = programs
            .iter_mut()
            .find(|e| e.config.id == config.id)
            .ok_or(SupervisorError::ProgramNotFound(config.id))?;
        entry.config = config;
        let info = entry.to_info();
        self.persist(&programs)?;
        Ok(info)
    }

    pub async fn remove(&self, id: u64) -> Result<(), SupervisorError> {
        let mut programs = self.programs.lock().await;
        let index = programs
            .iter()
            .position(|e| e.config.id == id)
            .ok_or(SupervisorError::ProgramNotFound(id))?;
        programs.remove(index);
        info!(program_id = id, "program removed");
        self.persist(&programs)
    }

    /// Start a program: make sure its multiplexer session exists, type the
    /// command into it, then try to find the resulting process.
    pub async fn start(&self, id: u64) -> Result<ProgramInfo, SupervisorError> {
        let config = self.config_snapshot(id).await?;
        self.screen.ensure_session(&config.screen_name).await?;
        self.screen
            .send_command(&config.screen_name, &config.command)
            .await?;
        tokio::time::sleep(STOP_GRACE_DELAY).await;

        let pid = self.resolve_pid(&config).await;
        let status = if pid.is_some() {
            ProgramStatus::Running
        } else {
            warn!(program_id = id, "started but no process resolved");
            ProgramStatus::Error
        };
        self.apply_runtime(id, status, pid, Some(true)).await
    }

    /// Ask a program to stop via its configured method, wait out the grace
    /// delay, and report whether it actually went away. `false` leaves the
    /// recorded state unchanged.
    pub async fn stop(&self, id: u64) -> Result<bool, SupervisorError> {
        let config = self.config_snapshot(id).await?;
        let pid = self.resolve_pid(&config).await;

        match config.stop_method {
            StopMethod::SigInt | StopMethod::SigHup => {
                let Some(pid) = pid else {
                    debug!(program_id = id, "stop requested but no pid resolved");
                    return Ok(false);
                };
                let signal = match config.stop_method {
                    StopMethod::SigInt => libc::SIGINT,
                    _ => libc::SIGHUP,
                };
                self.backend.send_signal(pid, signal)?;
            }
            StopMethod::SendInterruptKey => {
                self.screen.send_interrupt(&config.screen_name).await?;
            }
        }

        tokio::time::sleep(STOP_GRACE_DELAY).await;
        if self.resolve_pid(&config).await.is_some() {
            warn!(program_id = id, "process survived stop request");
            return Ok(false);
        }
        self.apply_runtime(id, ProgramStatus::Stopped, None, None)
            .await?;
        Ok(true)
    }

    /// Force-kill the program's whole process tree and take its multiplexer
    /// session down with it. Always ends in `stopped`.
    pub async fn terminate(&self, id: u64) -> Result<ProgramInfo, SupervisorError> {
        let config = self.config_snapshot(id).await?;
        if let Some(pid) = self.resolve_pid(&config).await {
            self.backend.kill_tree(pid);
        }
        if let Err(e) = self.screen.quit_session(&config.screen_name).await {
            debug!(program_id = id, error = %e, "quit after kill");
        }
        // A wedged session sometimes survives the first quit; wipe the dead
        // entry and try once more.
        if let Ok(Some(_)) = self.screen.find_session(&config.screen_name).await {
            let _ = self.screen.wipe().await;
            let _ = self.screen.quit_session(&config.screen_name).await;
        }
        self.apply_runtime(id, ProgramStatus::Stopped, None, Some(false))
            .await
    }

    /// One liveness pass over every program. Multiplexer-session liveness is
    /// authoritative: a gone or dead session forces `stopped` no matter what
    /// pid was recorded.
    pub async fn monitor(&self) {
        let snapshot: Vec<(ProgramConfig, ProgramStatus)> = {
            let programs = self.programs.lock().await;
            programs
                .iter()
                .map(|e| (e.config.clone(), e.status))
                .collect()
        };

        for (config, prev_status) in snapshot {
            let session = match self.screen.find_session(&config.screen_name).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(program_id = config.id, error = %e, "monitor query failed");
                    continue;
                }
            };
            let result = match session {
                Some(session) if !session.dead => {
                    let pid = self.backend.find_descendant(
                        session.pid,
                        &config.command,
                        config.max_child_depth,
                    );
                    let status = match (pid, prev_status) {
                        (Some(_), _) => ProgramStatus::Running,
                        (None, ProgramStatus::Running) => ProgramStatus::Error,
                        (None, other) => other,
                    };
                    self.apply_runtime(config.id, status, pid, Some(true)).await
                }
                _ => {
                    self.apply_runtime(config.id, ProgramStatus::Stopped, None, Some(false))
                        .await
                }
            };
            // Programs deleted mid-pass are fine.
            if let Err(SupervisorError::ProgramNotFound(_)) = result {
                continue;
            }
        }
    }

    /// Start everything flagged `auto_start`. Individual failures are logged
    /// and do not stop the rest.
    pub async fn autostart(&self) {
        let ids: Vec<u64> = {
            let programs = self.programs.lock().await;
            programs
                .iter()
                .filter(|e| e.config.auto_start)
                .map(|e| e.config.id)
                .collect()
        };
        for id in ids {
            if let Err(e) = self.start(id).await {
                warn!(program_id = id, error = %e, "autostart failed");
            }
        }
    }

    /// Run `monitor()` forever on the fixed interval.
    pub async fn run_monitor_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(MONITOR_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.monitor().await;
        }
    }

    async fn config_snapshot(&self, id: u64) -> Result<ProgramConfig, SupervisorError> {
        let programs = self.programs.lock().await;
        programs
            .iter()
            .find(|e| e.config.id == id)
            .map(|e| e.config.clone())
            .ok_or(SupervisorError::ProgramNotFound(id))
    }

    async fn resolve_pid(&self, config: &ProgramConfig) -> Option<u32> {
        let session = self
            .screen
            .find_session(&config.screen_name)
            .await
            .ok()
            .flatten()?;
        if session.dead {
            return None;
        }
        self.backend
            .find_descendant(session.pid, &config.command, config.max_child_depth)
    }

    /// Store new runtime fields and emit a status-change event if anything
    /// observable moved.
    async fn apply_runtime(
        &self,
        id: u64,
        status: ProgramStatus,
        pid: Option<u32>,
        screen_active: Option<bool>,
    ) -> Result<ProgramInfo, SupervisorError> {
        let mut programs = self.programs.lock().await;
        let entry = programs
            .iter_mut()
            .find(|e| e.config.id == id)
            .ok_or(SupervisorError::ProgramNotFound(id))?;
        let screen_active = screen_active.unwrap_or(entry.screen_active);
        let changed =
            entry.status != status || entry.pid != pid || entry.screen_active != screen_active;
        entry.status = status;
        entry.pid = pid;
        entry.screen_active = screen_active;
        let info = entry.to_info();
        drop(programs);

        if changed {
            info!(program_id = id, status = ?status, pid = ?pid, "program status changed");
            let _ = self.status_tx.send(info.clone());
        }
        Ok(info)
    }

    fn persist(&self, programs: &[ProgramEntry]) -> Result<(), SupervisorError> {
        let configs: Vec<ProgramConfig> = programs.iter().map(|e| e.config.clone()).collect();
        self.store.save(&configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::ScreenSession;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeScreenState {
        session: Option<ScreenSession>,
        commands: Vec<String>,
        interrupts: usize,
        quits: usize,
    }

    #[derive(Clone, Default)]
    struct FakeScreen {
        state: Arc<StdMutex<FakeScreenState>>,
    }

    impl FakeScreen {
        fn with_session(pid: u32, name: &str) -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().session = Some(ScreenSession {
                pid,
                name: name.to_string(),
                dead: false,
            });
            fake
        }

        fn drop_session(&self) {
            self.state.lock().unwrap().session = None;
        }
    }

    impl ScreenControl for FakeScreen {
        async fn find_session(
            &self,
            name: &str,
        ) -> Result<Option<ScreenSession>, SupervisorError> {
            let state = self.state.lock().unwrap();
            Ok(state.session.clone().filter(|s| s.name == name))
        }

        async fn ensure_session(&self, name: &str) -> Result<(), SupervisorError> {
            let mut state = self.state.lock().unwrap();
            if state.session.is_none() {
                state.session = Some(ScreenSession {
                    pid: 1000,
                    name: name.to_string(),
                    dead: false,
                });
            }
            Ok(())
        }

        async fn send_command(&self, _name: &str, command: &str) -> Result<(), SupervisorError> {
            self.state.lock().unwrap().commands.push(command.to_string());
            Ok(())
        }

        async fn send_interrupt(&self, _name: &str) -> Result<(), SupervisorError> {
            self.state.lock().unwrap().interrupts += 1;
            Ok(())
        }

        async fn quit_session(&self, _name: &str) -> Result<(), SupervisorError> {
            let mut state = self.state.lock().unwrap();
            state.quits += 1;
            state.session = None;
            Ok(())
        }

        async fn wipe(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubBackendState {
        pids: VecDeque<Option<u32>>,
        signals: Vec<(u32, i32)>,
        killed_trees: Vec<u32>,
    }

    #[derive(Clone, Default)]
    struct StubBackend {
        state: Arc<StdMutex<StubBackendState>>,
    }

    impl StubBackend {
        fn with_pids(pids: impl IntoIterator<Item = Option<u32>>) -> Self {
            let stub = Self::default();
            stub.state.lock().unwrap().pids = pids.into_iter().collect();
            stub
        }

        fn signals(&self) -> Vec<(u32, i32)> {
            self.state.lock().unwrap().signals.clone()
        }
    }

    impl ProcessBackend for StubBackend {
        fn find_descendant(&self, _root: u32, _command: &str, _depth: u32) -> Option<u32> {
            self.state.lock().unwrap().pids.pop_front().flatten()
        }

        fn send_signal(&self, pid: u32, signal: i32) -> std::io::Result<()> {
            self.state.lock().unwrap().signals.push((pid, signal));
            Ok(())
        }

        fn kill_tree(&self, pid: u32) {
            self.state.lock().unwrap().killed_trees.push(pid);
        }
    }

    fn sample_config(stop_method: StopMethod) -> ProgramConfig {
        ProgramConfig {
            id: 0,
            name: "web".to_string(),
            command: "python3 -m http.server".to_string(),
            screen_name: "web".to_string(),
            max_child_depth: 2,
            auto_start: false,
            stop_method,
        }
    }

    fn build(
        screen: FakeScreen,
        backend: StubBackend,
    ) -> (
        Supervisor<FakeScreen>,
        mpsc::UnboundedReceiver<ProgramInfo>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgramStore::new(dir.path().join("programs.json"));
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor =
            Supervisor::new(store, screen, Box::new(backend), tx).expect("supervisor");
        (supervisor, rx, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn stop_sighup_signals_exactly_once_when_pid_resolved() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([Some(4321), Some(4321), None]);
        let (supervisor, mut rx, _dir) = build(screen, backend.clone());
        let info = supervisor
            .add(sample_config(StopMethod::SigHup))
            .await
            .expect("add");
        supervisor.start(info.config.id).await.expect("start");
        while rx.try_recv().is_ok() {}

        let stopped = supervisor.stop(info.config.id).await.expect("stop");
        assert!(stopped);
        assert_eq!(backend.signals(), vec![(4321, libc::SIGHUP)]);

        let program = supervisor.get(info.config.id).await.expect("get");
        assert_eq!(program.status, ProgramStatus::Stopped);
        assert_eq!(program.pid, None);
        let event = rx.try_recv().expect("transition emitted");
        assert_eq!(event.status, ProgramStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_pid_returns_false_and_never_signals() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([None]);
        let (supervisor, _rx, _dir) = build(screen, backend.clone());
        let info = supervisor
            .add(sample_config(StopMethod::SigHup))
            .await
            .expect("add");

        let stopped = supervisor.stop(info.config.id).await.expect("stop");
        assert!(!stopped);
        assert!(backend.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupt_key_types_ctrl_c_instead_of_signaling() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([Some(77), None]);
        let (supervisor, _rx, _dir) = build(screen.clone(), backend.clone());
        let info = supervisor
            .add(sample_config(StopMethod::SendInterruptKey))
            .await
            .expect("add");

        let stopped = supervisor.stop(info.config.id).await.expect("stop");
        assert!(stopped);
        assert!(backend.signals().is_empty());
        assert_eq!(screen.state.lock().unwrap().interrupts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn surviving_process_fails_the_stop_and_keeps_state() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([Some(77), Some(77), Some(77)]);
        let (supervisor, _rx, _dir) = build(screen, backend);
        let info = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add");
        // Put the program into running via start (consumes one pid lookup).
        supervisor.start(info.config.id).await.expect("start");

        let stopped = supervisor.stop(info.config.id).await.expect("stop");
        assert!(!stopped);
        let program = supervisor.get(info.config.id).await.expect("get");
        assert_eq!(program.status, ProgramStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn start_resolves_pid_and_emits_running() {
        let screen = FakeScreen::default();
        let backend = StubBackend::with_pids([Some(555)]);
        let (supervisor, mut rx, _dir) = build(screen.clone(), backend);
        let info = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add");

        let started = supervisor.start(info.config.id).await.expect("start");
        assert_eq!(started.status, ProgramStatus::Running);
        assert_eq!(started.pid, Some(555));
        assert_eq!(
            screen.state.lock().unwrap().commands,
            vec!["python3 -m http.server".to_string()]
        );

        let event = rx.try_recv().expect("status event");
        assert_eq!(event.status, ProgramStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_resolved_pid_is_an_error_status() {
        let screen = FakeScreen::default();
        let backend = StubBackend::with_pids([None]);
        let (supervisor, _rx, _dir) = build(screen, backend);
        let info = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add");

        let started = supervisor.start(info.config.id).await.expect("start");
        assert_eq!(started.status, ProgramStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_dead_screen_overrides_stale_pid() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([Some(88), Some(88)]);
        let (supervisor, mut rx, _dir) = build(screen.clone(), backend);
        let info = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add");
        supervisor.start(info.config.id).await.expect("start");
        while rx.try_recv().is_ok() {}

        // Screen session vanishes; the recorded pid no longer matters.
        screen.drop_session();
        supervisor.monitor().await;

        let program = supervisor.get(info.config.id).await.expect("get");
        assert_eq!(program.status, ProgramStatus::Stopped);
        assert_eq!(program.pid, None);
        assert!(!program.screen_active);
        let event = rx.try_recv().expect("transition emitted");
        assert_eq!(event.status, ProgramStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_live_screen_without_pid_flags_error() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([Some(88), None]);
        let (supervisor, _rx, _dir) = build(screen, backend);
        let info = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add");
        supervisor.start(info.config.id).await.expect("start");

        supervisor.monitor().await;
        let program = supervisor.get(info.config.id).await.expect("get");
        assert_eq!(program.status, ProgramStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_always_ends_stopped() {
        let screen = FakeScreen::with_session(1000, "web");
        let backend = StubBackend::with_pids([Some(88)]);
        let (supervisor, _rx, _dir) = build(screen.clone(), backend.clone());
        let info = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add");

        let result = supervisor.terminate(info.config.id).await.expect("terminate");
        assert_eq!(result.status, ProgramStatus::Stopped);
        assert_eq!(
            backend.state.lock().unwrap().killed_trees,
            vec![88]
        );
        assert!(screen.state.lock().unwrap().quits >= 1);
    }

    #[tokio::test]
    async fn crud_assigns_ids_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("programs.json");
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            ProgramStore::new(&path),
            FakeScreen::default(),
            Box::new(StubBackend::default()),
            tx,
        )
        .expect("supervisor");

        let a = supervisor
            .add(sample_config(StopMethod::SigInt))
            .await
            .expect("add a");
        let b = supervisor
            .add(sample_config(StopMethod::SigHup))
            .await
            .expect("add b");
        assert_eq!(a.config.id, 1);
        assert_eq!(b.config.id, 2);

        let mut updated = b.config.clone();
        updated.name = "renamed".to_string();
        supervisor.update(updated).await.expect("update");
        supervisor.remove(a.config.id).await.expect("remove");

        // A fresh supervisor over the same file sees the surviving record.
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let reloaded = Supervisor::new(
            ProgramStore::new(&path),
            FakeScreen::default(),
            Box::new(StubBackend::default()),
            tx2,
        )
        .expect("reload");
        let programs = reloaded.list().await;
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].config.name, "renamed");
        assert_eq!(programs[0].status, ProgramStatus::Stopped);
    }

    #[tokio::test]
    async fn unknown_program_operations_error() {
        let (supervisor, _rx, _dir) =
            build(FakeScreen::default(), StubBackend::default());
        assert!(matches!(
            supervisor.get(9).await.unwrap_err(),
            SupervisorError::ProgramNotFound(9)
        ));
        assert!(matches!(
            supervisor.remove(9).await.unwrap_err(),
            SupervisorError::ProgramNotFound(9)
        ));
        assert!(supervisor.stop(9).await.is_err());
    }
}
