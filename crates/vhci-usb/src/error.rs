use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Wire-level problems against an individual transfer are not fatal: the
/// offending transfer is completed `unprocessed` and the next event is still
/// attempted. `Protocol` is returned only where the stream itself is
/// unusable (bad header, unknown event type) or a completion cannot be
/// applied to its transfer record.
#[derive(Debug, Error)]
pub enum Error {
    #[error("interface misuse: {0}")]
    Misuse(&'static str),
    #[error("entity not found")]
    NotFound,
    #[error("device is busy")]
    Busy,
    #[error("protocol error: {0}")]
    Protocol(#[from] vhci_protocol::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
