//! GNU screen driven over its CLI.
//!
//! Screen keeps a supervised program's I/O alive independent of this
//! process, so a supervisor restart can re-adopt running programs instead of
//! restarting them.

use std::future::Future;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::SupervisorError;

/// One entry parsed out of `screen -ls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSession {
    /// Pid of the screen server process owning the session.
    pub pid: u32,
    pub name: String,
    pub dead: bool,
}

/// Seam for the external multiplexer, so the supervisor state machine can be
/// exercised without a screen binary on the box.
pub trait ScreenControl: Send + Sync {
    fn find_session(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<ScreenSession>, SupervisorError>> + Send;

    /// Create the session if absent, reuse it if present.
    fn ensure_session(&self, name: &str)
    -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Type a command line into the session, as if at the keyboard.
    fn send_command(
        &self,
        name: &str,
        command: &str,
    ) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Type an interrupt keystroke (^C) into the session.
    fn send_interrupt(&self, name: &str)
    -> impl Future<Output = Result<(), SupervisorError>> + Send;

    fn quit_session(&self, name: &str)
    -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Clean up dead session entries.
    fn wipe(&self) -> impl Future<Output = Result<(), SupervisorError>> + Send;
}

/// CLI client for GNU screen.
pub struct ScreenClient {
    screen_path: String,
}

impl ScreenClient {
    pub fn new() -> Self {
        Self {
            screen_path: "screen".to_string(),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<ScreenSession>, SupervisorError> {
        // `screen -ls` exits non-zero when there are no sessions; only a
        // failure to run the binary at all is an error.
        let output = Command::new(&self.screen_path)
            .arg("-ls")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SupervisorError::Screen(format!("failed to run screen -ls: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_session_list(&stdout))
    }

    async fn run(&self, args: &[&str]) -> Result<(), SupervisorError> {
        let output = Command::new(&self.screen_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SupervisorError::Screen(format!("failed to run screen: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SupervisorError::Screen(format!(
                "screen {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl ScreenControl for ScreenClient {
    async fn find_session(&self, name: &str) -> Result<Option<ScreenSession>, SupervisorError> {
        let sessions = self.list_sessions().await?;
        Ok(sessions.into_iter().find(|s| s.name == name))
    }

    async fn ensure_session(&self, name: &str) -> Result<(), SupervisorError> {
        match self.find_session(name).await? {
            Some(session) if !session.dead => {
                debug!(screen = name, "reusing existing screen session");
                Ok(())
            }
            _ => self.run(&["-dmS", name]).await,
        }
    }

    async fn send_command(&self, name: &str, command: &str) -> Result<(), SupervisorError> {
        let line = format!("{command}\n");
        self.run(&["-S", name, "-X", "stuff", &line]).await
    }

    async fn send_interrupt(&self, name: &str) -> Result<(), SupervisorError> {
        self.run(&["-S", name, "-X", "stuff", "\x03"]).await
    }

    async fn quit_session(&self, name: &str) -> Result<(), SupervisorError> {
        self.run(&["-S", name, "-X", "quit"]).await
    }

    async fn wipe(&self) -> Result<(), SupervisorError> {
        // `screen -wipe` exits non-zero when nothing needed wiping; that is
        // not a failure here.
        let _ = Command::new(&self.screen_path)
            .arg("-wipe")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SupervisorError::Screen(format!("failed to run screen -wipe: {e}")))?;
        Ok(())
    }
}

impl Default for ScreenClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `screen -ls` output. Session lines are indented and look like
/// `\t12345.web\t(Detached)` or `\t12346.db\t(Dead ???)`.
pub fn parse_session_list(output: &str) -> Vec<ScreenSession> {
    let mut sessions = Vec::new();
    for line in output.lines() {
        if !line.starts_with('\t') && !line.starts_with(' ') {
            continue;
        }
        let trimmed = line.trim();
        let Some(ident) = trimmed.split_whitespace().next() else {
            continue;
        };
        let Some((pid_part, name)) = ident.split_once('.') else {
            continue;
        };
        let Ok(pid) = pid_part.parse::<u32>() else {
            continue;
        };
        sessions.push(ScreenSession {
            pid,
            name: name.to_string(),
            dead: trimmed.contains("Dead"),
        });
    }
    sessions
}
