//! The API layer: health and runtime status of one observer or consumer process.

pub mod handlers;
pub mod router;

pub use handlers::{StatusResponse, health_check_handler, liveness_handler, status_handler};
pub use router::{create_router, serve};
