//! # API Models
//!
//! Request and response bodies of the HTTP surface. These wrap the
//! service types rather than the database rows where the transport needs
//! extra fields.
//!
//! ## Organization
//!
//! - `requests.rs` - Incoming request bodies and query strings
//! - `responses.rs` - Outgoing response bodies
//!
//! ## Serialization
//!
//! Field names stay snake_case, matching the settings keys and the
//! event payloads clients already read.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;
