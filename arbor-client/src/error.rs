use std::io;
use thiserror::Error;

/// Client errors. `Remote` carries the server's error message verbatim.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Remote(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("process stream failed: {0}")]
    Stream(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
