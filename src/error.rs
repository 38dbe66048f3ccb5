// Shared error type for the tracker backend

#[derive(Debug)]
pub enum TrackerError {
    NetworkError(String),
    ParseError(String),
    FileError(String),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::NetworkError(e) => write!(f, "Network error: {}", e),
            TrackerError::ParseError(e) => write!(f, "Parse error: {}", e),
            TrackerError::FileError(e) => write!(f, "File error: {}", e),
        }
    }
}

impl std::error::Error for TrackerError {}

pub type Result<T> = std::result::Result<T, TrackerError>;
