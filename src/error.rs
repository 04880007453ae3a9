use std::fmt;

/// Visible failure modes per spec Section 7. `Restart` is deliberately not
/// a variant here: it is internal control flow (see `crate::guard::Restart`)
/// and must never reach a caller.
#[derive(Debug)]
pub enum PdxError {
    /// The tree driver exceeded its retry budget chasing restarts.
    OlcRetriesExceeded,
    /// `key.len() + payload.len() > maxKVSize`.
    HarnessTooBig,
    /// A page read or write against the backing file failed.
    Io(std::io::Error),
    /// Invalid environment/config at construction time.
    BadConfig(&'static str),
    /// The page store's virtual address range is exhausted.
    StoreFull,
    /// A concurrent scan needed more recently-visited-leaf guards than the
    /// configured bound allows (see `Tree::MAX_SCAN_GUARDS`).
    ScanGuardLimitExceeded,
}

impl fmt::Display for PdxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PdxError::OlcRetriesExceeded => {
                write!(f, "exceeded retry budget resolving an optimistic restart")
            }
            PdxError::HarnessTooBig => write!(f, "key + payload exceeds maxKVSize"),
            PdxError::Io(e) => write!(f, "page store io error: {e}"),
            PdxError::BadConfig(msg) => write!(f, "invalid configuration: {msg}"),
            PdxError::StoreFull => write!(f, "page store virtual address range exhausted"),
            PdxError::ScanGuardLimitExceeded => {
                write!(f, "range scan exceeded the bounded prefetch guard limit")
            }
        }
    }
}

impl std::error::Error for PdxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PdxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PdxError {
    fn from(e: std::io::Error) -> Self {
        PdxError::Io(e)
    }
}
