//! Daemon Module
//!
//! The long-running nodebeat service. One daemon owns the node registry,
//! the admission gate, the ingest worker pool, and the HTTP surface, and
//! coordinates their startup and drain ordering.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       nodebeat daemon                        │
//! │                                                              │
//! │   POST /telemetry ──▶ validate ──▶ admission gate            │
//! │                                        │ accept              │
//! │                                        ▼                     │
//! │   ┌─────────┐    ┌──────────────┐    ┌──────────────────┐    │
//! │   │ bounded │───▶│ worker pool  │───▶│ node registry    │    │
//! │   │ queue   │    │ (A2S + geo)  │    │ (SQLite, upsert) │    │
//! │   └─────────┘    └──────────────┘    └──────────────────┘    │
//! │                                        ▲                     │
//! │   GET/DELETE /api/* (bearer) ──────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod http;
pub mod lifecycle;

pub use http::HttpServer;
pub use lifecycle::{Daemon, DaemonState};
