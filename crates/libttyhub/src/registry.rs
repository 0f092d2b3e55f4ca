use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ttyhub_protocol::{ServerMessage, SessionId, SessionInfo};

use crate::error::HubError;
use crate::hub::{ConnectionHub, ConnectionId};
use crate::output::{OutputBuffer, OutputChunk};
use crate::session::PtySession;
use crate::spawn;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Diagnostic line appended to the buffer when a session's process ends.
const EXIT_NOTICE: &[u8] = b"\r\n[process exited]\r\n";

/// Result of attaching a connection to a session: the full buffer replay,
/// the info snapshot for the `connected` ack, and whether the connection was
/// already a member.
#[derive(Debug)]
pub struct AttachOutcome {
    pub info: SessionInfo,
    pub replay: Vec<OutputChunk>,
    pub rejoined: bool,
}

struct Inner {
    sessions: HashMap<SessionId, PtySession>,
    next_id: SessionId,
}

/// Owns all live PTY sessions. All mutation paths (create, close, attach,
/// detach, output recording) run under one lock, which makes buffer append
/// plus fan-out atomic per chunk and keeps removal exactly-once.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    hub: Arc<ConnectionHub>,
    /// Handed to each session's I/O pump so exit callbacks can re-enter the
    /// registry.
    self_ref: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(hub: Arc<ConnectionHub>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            hub,
            self_ref: self_ref.clone(),
        })
    }

    /// Validate a spawn spec, spawn the PTY and child, register the session,
    /// and start its I/O pump. Rejected or failed spawns leave the registry
    /// unchanged.
    pub async fn create(
        &self,
        shell: &str,
        title_note: Option<String>,
    ) -> Result<SessionInfo, HubError> {
        spawn::validate(shell)?;
        let argv = spawn::tokenize_or_shell(shell);
        let registry = self
            .self_ref
            .upgrade()
            .ok_or_else(|| HubError::Spawn("registry is shutting down".to_string()))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| HubError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HubError::Spawn(e.to_string()))?;
        // Only the master side is needed from here on.
        drop(pair.slave);

        let pid = child.process_id().unwrap_or_default();
        let killer = child.clone_killer();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HubError::Pty(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HubError::Pty(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;

        // Blocking reader thread: ship chunks to the async pump until EOF,
        // then reap the child.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        let read_task = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = child.wait();
        });

        let io_task = tokio::spawn(async move {
            while let Some(data) = chunk_rx.recv().await {
                registry.record_output(id, data).await;
            }
            let _ = read_task.await;
            registry.handle_exit(id).await;
        });

        let session = PtySession {
            id,
            created_at: SystemTime::now(),
            initial_command: argv,
            title_note,
            program_name: String::new(),
            pid,
            buffer: OutputBuffer::new(),
            connections: HashSet::new(),
            master: pair.master,
            writer,
            killer,
            io_task: Some(io_task),
        };
        let info = session.to_info();
        inner.sessions.insert(id, session);
        drop(inner);

        info!(session_id = id, pid, "session created");
        self.hub.broadcast(ServerMessage::SessionListChanged);
        Ok(info)
    }

    pub async fn get(&self, id: SessionId) -> Result<SessionInfo, HubError> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(&id)
            .map(PtySession::to_info)
            .ok_or(HubError::SessionNotFound(id))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<SessionInfo> =
            inner.sessions.values().map(PtySession::to_info).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Terminate the process and remove the session. Safe against the
    /// process exiting concurrently: whichever path runs first performs the
    /// single removal, the other finds the entry gone.
    pub async fn close(&self, id: SessionId) -> Result<(), HubError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(&id) else {
            return Err(HubError::SessionNotFound(id));
        };
        if let Err(e) = session.killer.kill() {
            // Already-dead children are fine; the exit path raced us.
            debug!(session_id = id, error = %e, "kill on close");
        }
        self.finalize_locked(&mut inner, id);
        Ok(())
    }

    /// Process-exit callback, invoked from the session's I/O pump once the
    /// PTY reaches EOF. Appends a final diagnostic line, then converges on
    /// the same removal path as `close`.
    pub async fn handle_exit(&self, id: SessionId) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            let chunk = session.buffer.push(EXIT_NOTICE.to_vec());
            for conn in session.connections.clone() {
                self.hub.send(
                    conn,
                    ServerMessage::Output {
                        id,
                        data: chunk.data.clone(),
                    },
                );
            }
        }
        self.finalize_locked(&mut inner, id);
    }

    /// The single removal path. First caller wins; `HashMap::remove` under
    /// the lock guarantees the notifications fire exactly once.
    fn finalize_locked(&self, inner: &mut Inner, id: SessionId) {
        let Some(session) = inner.sessions.remove(&id) else {
            return;
        };
        for conn in &session.connections {
            self.hub.send(*conn, ServerMessage::TerminalExited { id });
        }
        info!(session_id = id, "session removed");
        self.hub.broadcast(ServerMessage::SessionListChanged);
    }

    /// Add a connection to a session's fan-out set and hand back the replay.
    /// Attaching twice is benign: `rejoined` is set and the replay is still
    /// returned, so the caller can resend state.
    pub async fn attach(
        &self,
        id: SessionId,
        conn: ConnectionId,
    ) -> Result<AttachOutcome, HubError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(HubError::SessionNotFound(id))?;
        let rejoined = !session.connections.insert(conn);
        debug!(session_id = id, connection_id = conn, rejoined, "attached");
        Ok(AttachOutcome {
            info: session.to_info(),
            replay: session.buffer.replay(),
            rejoined,
        })
    }

    /// Remove a connection from a session's fan-out set. Detaching when not
    /// attached is a benign error; session state is unchanged.
    pub async fn detach(&self, id: SessionId, conn: ConnectionId) -> Result<(), HubError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(HubError::SessionNotFound(id))?;
        if !session.connections.remove(&conn) {
            return Err(HubError::NotAttached(id));
        }
        debug!(session_id = id, connection_id = conn, "detached");
        Ok(())
    }

    /// Defensive sweep on disconnect: drop the connection from every
    /// session's fan-out set it may still belong to.
    pub async fn detach_everywhere(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock().await;
        for session in inner.sessions.values_mut() {
            session.connections.remove(&conn);
        }
    }

    /// Write viewer input verbatim to the PTY. The writing connection must
    /// be a current member; beyond that there is no exclusivity: multiple
    /// viewers share the terminal, last writer wins.
    pub async fn write_input(
        &self,
        id: SessionId,
        conn: ConnectionId,
        data: &[u8],
    ) -> Result<(), HubError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(HubError::SessionNotFound(id))?;
        if !session.connections.contains(&conn) {
            return Err(HubError::NotAttached(id));
        }
        session
            .writer
            .write_all(data)
            .and_then(|_| session.writer.flush())
            .map_err(|e| HubError::Pty(e.to_string()))
    }

    /// Current buffer contents without mutating anything.
    pub async fn replay(&self, id: SessionId) -> Result<Vec<OutputChunk>, HubError> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(&id)
            .map(|s| s.buffer.replay())
            .ok_or(HubError::SessionNotFound(id))
    }

    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(), HubError> {
        let inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get(&id)
            .ok_or(HubError::SessionNotFound(id))?;
        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| HubError::Pty(e.to_string()))
    }

    /// Append a chunk to the session's buffer and fan it out to every
    /// attached connection. Append and fan-out happen under one lock
    /// acquisition, so each viewer observes chunks in production order.
    pub async fn record_output(&self, id: SessionId, data: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(&id) else {
            return;
        };
        let chunk = session.buffer.push(data);
        for conn in &session.connections {
            self.hub.send(
                *conn,
                ServerMessage::Output {
                    id,
                    data: chunk.data.clone(),
                },
            );
        }
    }

    /// Snapshot of (session id, foreground process group) for the poller.
    pub async fn foreground_process_groups(&self) -> Vec<(SessionId, i32)> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .filter_map(|(id, s)| s.foreground_process_group().map(|pgid| (*id, pgid)))
            .collect()
    }

    /// Store a freshly resolved foreground-process name and notify attached
    /// viewers if it changed. Tolerates the session having disappeared since
    /// the poller snapshot.
    pub async fn refresh_program_name(&self, id: SessionId, name: String) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(&id) else {
            return;
        };
        if session.program_name == name {
            return;
        }
        session.program_name = name.clone();
        for conn in &session.connections {
            self.hub.send(
                *conn,
                ServerMessage::ProgramNameChanged {
                    terminal_id: id,
                    program_name: name.clone(),
                },
            );
        }
    }

    /// Shutdown drain: kill every live session and await each exit
    /// acknowledgement. Bounded by the slowest process kill.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut inner = self.inner.lock().await;
            let mut handles = Vec::new();
            for session in inner.sessions.values_mut() {
                if let Err(e) = session.killer.kill() {
                    debug!(session_id = session.id, error = %e, "kill on drain");
                }
                if let Some(handle) = session.io_task.take() {
                    handles.push(handle);
                }
            }
            handles
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "io task ended abnormally during drain");
            }
        }
        info!("all sessions drained");
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}
