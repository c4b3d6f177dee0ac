//! # jackal-xmpp
//!
//! XMPP server core: everything between an authenticated client stream and
//! the storage backend.
//!
//! ## Architecture
//!
//! - **SessionTable**: bound client sessions and their presence cache
//! - **Router**: delivers stanzas to components, modules or sessions,
//!   enforcing per-user block lists
//! - **Modules**: IQ handlers consulted in registration order
//! - **Components**: services answering for their own domain (pubsub)
//! - **EventBus**: session and presence lifecycle notifications
//! - **Repository**: async storage traits with an in-memory backend
//!
//! ## XEP Support
//!
//! - RFC 6120/6121 (XMPP Core/IM: roster, presence subscriptions)
//! - XEP-0004 (Data Forms)
//! - XEP-0012 (Last Activity)
//! - XEP-0030 (Service Discovery)
//! - XEP-0060 (Publish-Subscribe)
//! - XEP-0115 (Entity Capabilities)
//! - XEP-0160 (Offline Messages)
//! - XEP-0191 (Blocking Command)
//! - XEP-0199 (XMPP Ping)

pub mod address;
pub mod c2s;
pub mod components;
pub mod config;
pub mod context;
pub mod events;
pub mod hosts;
pub mod modules;
pub mod ns;
pub mod presence;
pub mod pubsub;
pub mod queue;
pub mod registry;
pub mod roster;
pub mod routing;
pub mod server;
pub mod stanza;
pub mod storage;
pub mod xep;

mod error;

pub use c2s::C2sHandler;
pub use config::{CoreConfig, ResourceConflict};
pub use context::Context;
pub use error::{stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError};
pub use events::{Event, EventBus, EventKind};
pub use registry::{C2sSession, Outbound};
pub use server::{XmppCore, XmppCoreBuilder};
pub use stanza::Stanza;
pub use storage::{InMemoryRepository, Repository};
