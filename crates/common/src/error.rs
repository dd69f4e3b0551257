//! Error types shared by the relay crates.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid call update: {0}")]
    InvalidUpdate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
