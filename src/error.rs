use thiserror::Error;

/// Error kinds surfaced by the record layer, KV overlay, and event log.
///
/// There is no `Ok` variant: success is plain `Result::Ok`, matching the
/// original C interface's `PBLOG_SUCCESS` folding into a zero return.
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer too small on read, or region/log full on write.
    #[error("no space")]
    NoSpace,
    /// Malformed framing or an out-of-range argument.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Header+payload checksum did not sum to zero.
    #[error("checksum mismatch")]
    Checksum,
    /// The flash port returned a short transfer or a negative status.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::Invalid(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
