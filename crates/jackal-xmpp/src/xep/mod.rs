//! XMPP Extension Protocols (XEPs) Implementation
//!
//! Wire formats and helpers for the extensions the core speaks.
//!
//! ## Implemented XEPs
//!
//! - **XEP-0004**: Data Forms - used by pubsub node configuration.
//! - **XEP-0115**: Entity Capabilities - capability hashes carried in
//!   presence, cached per `(node, ver)`.
//! - **XEP-0191**: Blocking Command - block list wire format.

pub mod xep0004;
pub mod xep0115;
pub mod xep0191;

pub use xep0004::{DataForm, Field, FormType, FORM_TYPE};

pub use xep0115::{compute_caps_hash, extract_caps, CapabilitiesCache, Caps};

pub use xep0191::{
    build_block_push, build_blocklist_response, build_unblock_push, is_blocking_query,
    parse_blocking_request, BlockingRequest,
};
