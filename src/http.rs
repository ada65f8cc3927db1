//! HTTP surface: a hand-rolled `hyper` router, CORS and API-key wrapper,
//! and the per-route handlers.
//!
//! Routing and middleware are out of the core's scope on paper, but a
//! runnable service still needs *a* surface; this module is deliberately
//! minimal rather than pulling in a routing framework.

pub mod handlers;
pub mod server;

pub use server::{serve, AppState};
