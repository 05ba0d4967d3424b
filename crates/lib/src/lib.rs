//! # Boot environment manager
//!
//! This crate builds OS images from a local Containerfile and tracks them
//! as named boot environments which the system can be rebased onto with
//! `rpm-ostree`.

pub mod build;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod environments;
mod error;
pub mod init;
pub mod progress;
pub mod rebase;
pub mod registry;
pub mod spec;
pub mod status;
pub mod store;

#[cfg(test)]
mod testutils;

pub use error::{Error, Result, EXIT_VALIDATION};
