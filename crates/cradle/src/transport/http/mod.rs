//! HTTP acceptor: WebSocket upgrade on `/main`, health and shutdown routes.

pub mod routes;
pub mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve, serve_on};
