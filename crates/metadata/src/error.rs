//! Error type for assembly reading.

/// Error raised while reading an assembly file.
///
/// `Malformed` means the bytes contradict ECMA-335; `Unsupported` means the
/// file uses a feature this reader deliberately does not model (the message
/// names it). Both carry enough context to identify the offending structure.
#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Malformed(String),
    Unsupported(String),
}

impl MetadataError {
    pub fn malformed(msg: impl Into<String>) -> MetadataError {
        MetadataError::Malformed(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> MetadataError {
        MetadataError::Unsupported(msg.into())
    }
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(e) => write!(f, "I/O error: {}", e),
            MetadataError::Malformed(s) => write!(f, "malformed metadata: {}", s),
            MetadataError::Unsupported(s) => write!(f, "unsupported metadata: {}", s),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, MetadataError>;
