use std::collections::HashSet;
use std::time::SystemTime;

use portable_pty::{ChildKiller, MasterPty};
use tokio::task::JoinHandle;

use ttyhub_protocol::{SessionId, SessionInfo};

use crate::hub::ConnectionId;
use crate::output::OutputBuffer;

/// One PTY plus the child process driving it, the replay buffer, and the set
/// of viewer connections currently attached for fan-out.
///
/// The session exclusively owns the PTY and the child; it only *tracks*
/// connections, whose lifecycles belong to the transport layer.
pub struct PtySession {
    pub id: SessionId,
    pub created_at: SystemTime,
    /// The argv used to spawn, retained for diagnostics.
    pub initial_command: Vec<String>,
    pub title_note: Option<String>,
    /// Foreground process label, refreshed by the poller. Empty until first
    /// resolved.
    pub program_name: String,
    pub pid: u32,
    pub buffer: OutputBuffer,
    pub connections: HashSet<ConnectionId>,
    pub(crate) master: Box<dyn MasterPty + Send>,
    pub(crate) writer: Box<dyn std::io::Write + Send>,
    pub(crate) killer: Box<dyn ChildKiller + Send + Sync>,
    /// Exit-watch task; taken during shutdown drain so the caller can await
    /// the exit acknowledgement.
    pub(crate) io_task: Option<JoinHandle<()>>,
}

impl PtySession {
    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            pid: self.pid,
            program_name: self.program_name.clone(),
            created_at: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            title_note: self.title_note.clone(),
            initial_command: self.initial_command.clone(),
            connection_count: self.connections.len(),
        }
    }

    /// The foreground process group of the PTY, if the platform can tell.
    pub fn foreground_process_group(&self) -> Option<i32> {
        self.master.process_group_leader()
    }
}
