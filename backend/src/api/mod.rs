//! # REST API Module
//!
//! HTTP surface of the broker: user order flows under `/users/{user_id}`
//! and the admin operations under `/admin`.
//!
//! ## Request/Response Format
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "forbidden",
//!         "message": "Forbidden: outside the emergency renew window"
//!     }
//! }
//! ```

pub mod handlers;
pub mod routes;

pub use routes::configure_routes;
