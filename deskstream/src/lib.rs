//! # deskstream — screen streaming binary
//!
//! Wraps a `deskstream-core` session in a command-line process: TOML
//! configuration, logging and exit codes.
//!
//! ## Modes
//!
//! - **Loopback**: capture and present locally (default).
//! - **Server / Client**: stream over UDP to a known address.
//! - **Host / Join**: the same, with the server address carried in a
//!   shareable session id.

pub mod config;
pub mod service;
