pub mod error;
pub mod procscan;
pub mod screen;
pub mod store;
pub mod supervisor;

pub use error::SupervisorError;
pub use procscan::{ProcessBackend, SysProcessBackend};
pub use screen::{ScreenClient, ScreenControl, ScreenSession};
pub use store::ProgramStore;
pub use supervisor::{MONITOR_INTERVAL, STOP_GRACE_DELAY, Supervisor};
