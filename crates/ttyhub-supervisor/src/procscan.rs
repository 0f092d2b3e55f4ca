//! Process-table queries for pid resolution and tree teardown.

use std::collections::HashMap;
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// Seam over the OS process table and signal delivery, so supervisor state
/// transitions can be tested without real processes.
pub trait ProcessBackend: Send + Sync {
    /// Walk `root_pid`'s descendants up to `max_depth` levels looking for a
    /// process running `command`. Best-effort; `None` on any failure.
    fn find_descendant(&self, root_pid: u32, command: &str, max_depth: u32) -> Option<u32>;

    /// Deliver `signal` to `pid`.
    fn send_signal(&self, pid: u32, signal: i32) -> std::io::Result<()>;

    /// Force-kill `pid` and every descendant, children first.
    fn kill_tree(&self, pid: u32);
}

pub struct SysProcessBackend {
    system: Mutex<System>,
}

impl SysProcessBackend {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refreshed(&self) -> std::sync::MutexGuard<'_, System> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        system
    }
}

impl Default for SysProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend for SysProcessBackend {
    fn find_descendant(&self, root_pid: u32, command: &str, max_depth: u32) -> Option<u32> {
        let word = command_word(command)?;
        let system = self.refreshed();

        let children = child_map(&system);
        let mut frontier = vec![Pid::from_u32(root_pid)];
        for _ in 0..max_depth.max(1) {
            let mut next = Vec::new();
            for pid in frontier {
                for &child in children.get(&pid).map(Vec::as_slice).unwrap_or(&[]) {
                    let Some(process) = system.process(child) else {
                        continue;
                    };
                    if process_matches(process, command, word) {
                        return Some(child.as_u32());
                    }
                    next.push(child);
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        debug!(root_pid, command, "no matching descendant found");
        None
    }

    fn send_signal(&self, pid: u32, signal: i32) -> std::io::Result<()> {
        let pid_t = libc::pid_t::try_from(pid)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        // SAFETY: plain kill(2) on a validated pid; no memory is involved.
        let rc = unsafe { libc::kill(pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn kill_tree(&self, pid: u32) {
        let descendants = {
            let system = self.refreshed();
            let children = child_map(&system);
            collect_descendants(&children, Pid::from_u32(pid))
        };
        // Children first so nothing gets reparented mid-teardown and
        // escapes.
        for target in descendants.into_iter().rev() {
            let _ = self.send_signal(target.as_u32(), libc::SIGKILL);
        }
        let _ = self.send_signal(pid, libc::SIGKILL);
    }
}

fn child_map(system: &System) -> HashMap<Pid, Vec<Pid>> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }
    children
}

fn collect_descendants(children: &HashMap<Pid, Vec<Pid>>, root: Pid) -> Vec<Pid> {
    let mut out = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or(&[]) {
            out.push(child);
            frontier.push(child);
        }
    }
    out
}

fn process_matches(process: &sysinfo::Process, command: &str, word: &str) -> bool {
    let name = process.name().to_string_lossy();
    if name == word {
        return true;
    }
    // /proc comm is truncated to 15 bytes; accept a truncated prefix too.
    if name.len() >= 15 && word.starts_with(name.as_ref()) {
        return true;
    }
    let cmdline = process
        .cmd()
        .iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    cmdline.contains(command)
}

/// The binary name of a command line: first word, path stripped.
fn command_word(command: &str) -> Option<&str> {
    let first = command.split_whitespace().next()?;
    Some(first.rsplit('/').next().unwrap_or(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_word_strips_paths() {
        assert_eq!(command_word("/usr/bin/python3 -m http.server"), Some("python3"));
        assert_eq!(command_word("redis-server"), Some("redis-server"));
        assert_eq!(command_word("   "), None);
    }

    #[test]
    fn own_process_tree_is_visible() {
        // This test process has a parent; walking from the parent with depth
        // 1 must find us by our own name.
        let backend = SysProcessBackend::new();
        let me = std::process::id();
        let parent = {
            let system = backend.refreshed();
            system
                .process(Pid::from_u32(me))
                .and_then(|p| p.parent())
                .map(|p| p.as_u32())
        };
        let Some(parent) = parent else {
            // Pid 1 in a minimal container; nothing to assert.
            return;
        };
        let my_name = {
            let system = backend.refreshed();
            system
                .process(Pid::from_u32(me))
                .map(|p| p.name().to_string_lossy().into_owned())
        };
        let Some(my_name) = my_name else { return };
        let found = backend.find_descendant(parent, &my_name, 1);
        assert!(found.is_some());
    }
}
