//! Shared types for the Kiro credential pool workspace
//!
//! `Secret` keeps OAuth tokens out of logs; `Error` covers configuration
//! loading for the daemon.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
