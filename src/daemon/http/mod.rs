//! HTTP front end: open telemetry intake plus a bearer-protected admin API.

pub mod auth;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod types;

pub use server::HttpServer;
