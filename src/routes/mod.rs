//! Route modules for the tus upload server

pub mod health;
pub mod tus;

pub use tus::{setup_tus, setup_tus_with, EXPOSED_HEADERS};
