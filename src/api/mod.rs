//! HTTP surface — a thin layer over [`crate::router`].
//!
//! Handlers translate HTTP concerns (status codes, JSON bodies, SSE) into
//! router calls and back; no routing logic lives here.

pub mod request_id;
pub mod routes;
