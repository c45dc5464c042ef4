// Data Engine Module
// Unified client contract over relational and document stores

pub mod capabilities;
pub mod changes;
pub mod classifier;
pub mod connection_manager;
pub mod credentials;
pub mod cursor;
pub mod drivers;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod query_log;
pub mod query_manager;
pub mod registry;
pub mod session_manager;
pub mod sql;
pub mod ssh_tunnel;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use capabilities::Capabilities;
pub use connection_manager::{ActiveConnection, ConnectionManager, ConnectionSummary};
pub use cursor::{CursorPhase, CursorState, StreamingCursor};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use pipeline::{QueryOptions, QueryPipeline};
pub use query_manager::QueryManager;
pub use registry::{ConnectContext, DriverRegistry};
pub use session_manager::SessionManager;
pub use traits::{ClientAdapter, ReservedConnection};
pub use types::*;
