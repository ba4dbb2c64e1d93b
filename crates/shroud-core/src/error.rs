use thiserror::Error;

pub type ShroudResult<T> = Result<T, ShroudError>;

#[derive(Debug, Error)]
pub enum ShroudError {
    /// Wrong passphrase, or a ciphertext whose tag does not verify.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A remote object or byte layout that does not decode.
    #[error("format error: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote store error: {0}")]
    Remote(String),

    /// Filesystem failure tied to a specific local path.
    #[error("local I/O error on {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShroudError {
    pub fn local_io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        ShroudError::LocalIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// True for errors that mean "the object does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShroudError::NotFound(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ShroudError::Authentication(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_io_carries_path() {
        let err = ShroudError::local_io(
            "/tmp/missing.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/missing.bin"), "got: {msg}");
        assert!(msg.contains("gone"));
    }

    #[test]
    fn predicates() {
        assert!(ShroudError::NotFound("k".into()).is_not_found());
        assert!(!ShroudError::Remote("down".into()).is_not_found());
        assert!(ShroudError::Authentication("tag".into()).is_authentication());
    }
}
