//! Batch email composition and delivery.
//!
//! Reads recipient rows and templates from a data directory, renders one message
//! per row, delivers it over SMTP or OAuth2 and records every outcome in a CSV ledger.

pub mod attachments;
pub mod config;
pub mod data;
pub mod delivery;
pub mod error;
pub mod ledger;
pub mod message;
pub mod probe;
pub mod render;
pub mod template;
pub mod transport;

pub use error::{BatchmailError, ErrorKind};
pub type Result<T> = std::result::Result<T, BatchmailError>;
