//! Slurm error abstractions.

use thiserror::Error;

/// The broad classes into which remote Slurm failures fall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The failure means "nothing there"; callers treat it as a successful no-op.
    Tolerable,
    /// The failure is transient; the reconcile pass should be retried with backoff.
    Retryable,
    /// The failure will not go away by retrying the same request.
    Fatal,
}

/// Error variants returned by Slurm API clients.
#[derive(Clone, Debug, Error)]
pub enum SlurmError {
    /// The requested object does not exist.
    #[error("not found")]
    NotFound,
    /// The server answered without content.
    #[error("no content")]
    NoContent,
    /// The server rejected the request.
    #[error("slurm api returned status {status}: {message}")]
    Api { status: u16, message: String },
    /// The request never produced a response.
    #[error("slurm api transport error: {0}")]
    Transport(String),
    /// The response body could not be understood.
    #[error("invalid slurm api response: {0}")]
    Decode(String),
}

impl SlurmError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound | Self::NoContent => ErrorClass::Tolerable,
            Self::Transport(_) => ErrorClass::Retryable,
            Self::Api { status, .. } if *status == 429 || *status >= 500 => ErrorClass::Retryable,
            Self::Api { .. } | Self::Decode(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is tolerable, which is to say a no-op.
    pub fn is_tolerable(&self) -> bool {
        self.class() == ErrorClass::Tolerable
    }
}

/// Extension methods for results carrying a `SlurmError`.
pub trait SlurmResultExt<T> {
    /// Map tolerable errors to `None`, leaving all other errors in place.
    fn tolerate(self) -> Result<Option<T>, SlurmError>;
}

impl<T> SlurmResultExt<T> for Result<T, SlurmError> {
    fn tolerate(self) -> Result<Option<T>, SlurmError> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(err) if err.is_tolerable() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification_matches_status() {
        let cases = [
            (SlurmError::NotFound, ErrorClass::Tolerable),
            (SlurmError::NoContent, ErrorClass::Tolerable),
            (SlurmError::Transport("reset".into()), ErrorClass::Retryable),
            (SlurmError::Api { status: 503, message: "busy".into() }, ErrorClass::Retryable),
            (SlurmError::Api { status: 429, message: "slow down".into() }, ErrorClass::Retryable),
            (SlurmError::Api { status: 400, message: "bad".into() }, ErrorClass::Fatal),
            (SlurmError::Decode("eof".into()), ErrorClass::Fatal),
        ];
        for (err, expected) in cases {
            let class = err.class();
            assert!(class == expected, "expected {:?} for {}, got {:?}", expected, err, class);
        }
    }

    #[test]
    fn tolerate_maps_only_tolerable_errors() {
        let res: Result<u8, SlurmError> = Err(SlurmError::NotFound);
        assert!(matches!(res.tolerate(), Ok(None)), "expected not found to be tolerated");

        let res: Result<u8, SlurmError> = Ok(7);
        assert!(matches!(res.tolerate(), Ok(Some(7))), "expected value to pass through");

        let res: Result<u8, SlurmError> = Err(SlurmError::Transport("refused".into()));
        assert!(res.tolerate().is_err(), "expected transport error to be surfaced");
    }
}
