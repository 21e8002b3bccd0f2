//! Error types for vtt-net

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The connection closed before (or while) the operation could complete.
    /// Carries no close reason: the `Connection` contract is reason-agnostic.
    #[error("connection closed")]
    Closed,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
