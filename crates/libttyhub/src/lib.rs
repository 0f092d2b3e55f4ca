pub mod error;
pub mod hub;
pub mod output;
pub mod poller;
pub mod registry;
pub mod session;
pub mod spawn;

pub use error::HubError;
pub use hub::{ConnectionHub, ConnectionId};
pub use output::{OutputBuffer, OutputChunk};
pub use registry::{AttachOutcome, SessionRegistry};
pub use session::PtySession;
