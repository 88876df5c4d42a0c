//! Error types for the disk LRU store

use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    Io(Box<std::io::Error>),
    Corrupt(String),
    InvalidKey(String),
    Config(String),
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "IO error: {}", err),
            StoreError::Corrupt(msg) => write!(f, "Corrupt store: {}", msg),
            StoreError::InvalidKey(key) => write!(f, "Invalid key: {:?}", key),
            StoreError::Config(msg) => write!(f, "Configuration error: {}", msg),
            StoreError::Closed => write!(f, "Store is closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_error_display() {
        let err = StoreError::Corrupt("unexpected journal header".to_string());
        assert_eq!(format!("{}", err), "Corrupt store: unexpected journal header");
    }

    #[test]
    fn test_invalid_key_display() {
        let err = StoreError::InvalidKey("has space".to_string());
        assert!(format!("{}", err).contains("has space"));
    }

    #[test]
    fn test_io_error_has_source() {
        let err = StoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
