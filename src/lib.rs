//! tus Upload Server Library
//!
//! Resumable uploads over HTTP (tus 1.0.0). The protocol engine lives in
//! `tus`; `routes` mounts it on an axum router. The server binary is in
//! main.rs.
//!
//! # Modules
//!
//! - `tus`: Registry, store, locking, and the protocol state machine
//! - `routes`: HTTP adapter and health endpoint
//! - `config`: Environment-driven configuration

pub mod config;
pub mod routes;
pub mod state;
pub mod tus;
