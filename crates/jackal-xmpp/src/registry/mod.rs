//! Session registry for bound client streams.
//!
//! Maintains the mapping between JIDs and their sessions, used by the
//! router for delivery and by modules as the presence cache.

pub mod session;
pub mod session_table;

pub use session::{
    C2sSession, Outbound, BLOCKLIST_REQUESTED, INITIAL_PRESENCE_SENT, ROSTER_REQUESTED,
};
pub use session_table::SessionTable;
