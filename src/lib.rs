pub mod adapters;
pub mod attachments;
pub mod autofix;
pub mod change_block;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod deploy;
pub mod framing;
pub mod gateway;
pub mod logging;
pub mod rate_limit;
pub mod redaction;
pub mod repository;
pub mod specs;
pub mod str_utils;
pub mod transport;
pub mod types;

pub use types::*;
