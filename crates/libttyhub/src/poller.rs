//! Foreground-process name refresh.
//!
//! There is no portable push notification for "the foreground process group
//! of this PTY changed", so this polls on a fixed interval: read the
//! foreground process group off each live master PTY, look its name up in
//! the process table, and store the result back if it changed. Resolution
//! failures (process gone, permission denied) are swallowed and the stale
//! name kept.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::registry::SessionRegistry;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Start the background poll loop. The loop only reads registry snapshots
/// and updates single-field metadata; it never blocks session creation or
/// teardown.
pub fn spawn(registry: Arc<SessionRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new();
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let targets = registry.foreground_process_groups().await;
            for (session_id, pgid) in targets {
                let Some(name) = resolve_process_name(&mut system, pgid) else {
                    continue;
                };
                // The session may have disappeared since the snapshot; the
                // registry tolerates that.
                registry.refresh_program_name(session_id, name).await;
            }
        }
    })
}

/// Best-effort name lookup for the process leading a process group.
fn resolve_process_name(system: &mut System, pgid: i32) -> Option<String> {
    let pid = u32::try_from(pgid).ok()?;
    let pid = Pid::from_u32(pid);
    let refreshed = system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    if refreshed == 0 {
        debug!(pgid, "foreground process not found in process table");
        return None;
    }
    let process = system.process(pid)?;
    let name = process.name().to_string_lossy().into_owned();
    if name.is_empty() { None } else { Some(name) }
}
