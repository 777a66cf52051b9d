//! # Zapflow Gateway
//! HTTP API: dispatch submission, progress polling and channel management.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
