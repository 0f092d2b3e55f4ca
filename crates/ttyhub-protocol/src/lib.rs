use serde::{Deserialize, Serialize};

/// Unique identifier for a terminal session. Ids are assigned by the server
/// from a monotonically increasing counter and never reused while the entry
/// is live.
pub type SessionId = u64;

/// Messages sent by a viewer over the WebSocket.
///
/// Event and field names follow the legacy wire protocol: camelCase for the
/// RPC calls and payload fields, with a handful of historical snake_case
/// event names kept verbatim.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Connection handshake. Must be the first message; carries either
    /// credentials or a previously issued token.
    Auth {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
    /// Attach this connection to a session's output fan-out.
    Attach { id: SessionId },
    /// Write bytes verbatim to a session's PTY.
    Input {
        id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Re-send the full output buffer without mutating it.
    Refresh { id: SessionId },
    /// Remove this connection from a session's fan-out set.
    Detach { id: SessionId },
    /// Resize a session's PTY.
    Resize { id: SessionId, cols: u16, rows: u16 },

    // RPC-style calls. `rpc_id` is a caller-generated correlation id echoed
    // back in the `rpcResult` response.
    CreateTerminal {
        shell: String,
        #[serde(default)]
        title_note: Option<String>,
        rpc_id: String,
    },
    ListTerminals { rpc_id: String },
    GetTerminalInfo { id: SessionId, rpc_id: String },
    CloseTerminal { id: SessionId, rpc_id: String },

    ListPrograms { rpc_id: String },
    CreateProgram { program: ProgramConfig, rpc_id: String },
    UpdateProgram { program: ProgramConfig, rpc_id: String },
    DeleteProgram { id: u64, rpc_id: String },
    StartProgram { id: u64, rpc_id: String },
    StopProgram { id: u64, rpc_id: String },
    TerminateProgram { id: u64, rpc_id: String },
}

/// Messages pushed by the server.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Handshake accepted; the connection may now attach and issue RPCs.
    AuthOk,
    /// New output chunk from a session's PTY.
    Output {
        id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Attach acknowledged. Sent after the buffer replay.
    Connected {
        id: SessionId,
        pid: u32,
        program_name: String,
        created_at: u64,
        #[serde(default)]
        title_note: Option<String>,
    },
    /// The session's process ended (or the session was closed).
    #[serde(rename = "terminal_exited")]
    TerminalExited { id: SessionId },
    /// Detach acknowledged; the connection stays open.
    Detached { id: SessionId },
    /// Foreground process name refresh from the poller.
    ProgramNameChanged {
        terminal_id: SessionId,
        program_name: String,
    },
    /// Operation failed; `data` is a human-readable reason.
    Error {
        #[serde(default)]
        id: Option<SessionId>,
        data: String,
        code: ErrorCode,
    },
    /// The set of live sessions changed; clients should reconcile via
    /// `listTerminals`.
    SessionListChanged,
    /// A supervised program changed status.
    ProgramStatusChanged { program: ProgramInfo },
    /// RPC response carrying the caller's correlation id.
    RpcResult {
        rpc_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Structured error codes, mirrored from the core error types.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    CommandRejected,
    NotAttached,
    AlreadyAttached,
    AuthFailed,
    InvalidRequest,
    SpawnFailed,
    ProgramNotFound,
    ServerError,
}

/// Snapshot of a live session, returned by the terminal RPCs and the
/// `connected` acknowledgement.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: u32,
    pub program_name: String,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    #[serde(default)]
    pub title_note: Option<String>,
    /// The argv the session was spawned with, retained for diagnostics.
    pub initial_command: Vec<String>,
    pub connection_count: usize,
}

/// How `stop()` asks a supervised program to shut down.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMethod {
    #[serde(rename = "SIGINT")]
    SigInt,
    #[serde(rename = "SIGHUP")]
    SigHup,
    #[serde(rename = "SEND-INTERRUPT-KEY")]
    SendInterruptKey,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProgramStatus {
    Running,
    #[default]
    Stopped,
    Error,
}

/// Persisted definition of a supervised program.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgramConfig {
    /// Assigned by the server on create; ignored on input.
    #[serde(default)]
    pub id: u64,
    pub name: String,
    /// Shell command sent into the multiplexer session on start.
    pub command: String,
    /// External multiplexer session name owning the program's I/O.
    pub screen_name: String,
    /// How deep below the multiplexer process to look when resolving a pid.
    pub max_child_depth: u32,
    #[serde(default)]
    pub auto_start: bool,
    pub stop_method: StopMethod,
}

/// Runtime view of a program: the persisted config plus fields refreshed by
/// the monitor pass. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProgramInfo {
    #[serde(flatten)]
    pub config: ProgramConfig,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: ProgramStatus,
    pub screen_active: bool,
}

/// Base64 encoding for byte payloads in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
