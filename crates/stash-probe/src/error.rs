//! Error types for the stash probe

use std::fmt;

#[derive(Debug)]
pub enum ProbeError {
    Stash(blob_stash::StashError),
    Io(Box<std::io::Error>),
    Json(serde_json::Error),
    Config(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Stash(err) => write!(f, "Stash error: {}", err),
            ProbeError::Io(err) => write!(f, "IO error: {}", err),
            ProbeError::Json(err) => write!(f, "JSON error: {}", err),
            ProbeError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Stash(err) => Some(err),
            ProbeError::Io(err) => Some(err.as_ref()),
            ProbeError::Json(err) => Some(err),
            ProbeError::Config(_) => None,
        }
    }
}

impl From<blob_stash::StashError> for ProbeError {
    fn from(err: blob_stash::StashError) -> Self {
        ProbeError::Stash(err)
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        ProbeError::Json(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProbeError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProbeError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_error_display() {
        let err = ProbeError::from(blob_stash::StashError::NotFound("movie.mkv".to_string()));
        assert_eq!(format!("{}", err), "Stash error: Not found: movie.mkv");
    }

    #[test]
    fn test_config_error_display() {
        let err = ProbeError::Config("no input files".to_string());
        assert_eq!(format!("{}", err), "Configuration error: no input files");
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error;
        let err = ProbeError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert!(err.source().is_some());
    }
}
