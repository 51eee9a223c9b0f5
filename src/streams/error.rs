use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// Every failure the stream engine can report.
///
/// The type is `Clone` because one failure usually settles several
/// outstanding futures at once (pending reads, the closed future, ready).
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream is already locked to a reader or writer")]
    LockContention,
    #[error("stream is not locked by this handle")]
    NotLocked,
    #[error("failed to allocate {requested} bytes")]
    AllocationFailure { requested: usize },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("bytes written ({written}) exceed view length ({view_len})")]
    Range { written: usize, view_len: usize },
    #[error("{}", reason_message("Stream was canceled", .0))]
    Canceled(Option<String>),
    #[error("{}", reason_message("Stream was aborted", .0))]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Reader or writer lock was released")]
    Released,
    #[error("Stream was terminated")]
    Terminated,
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

fn reason_message(prefix: &str, reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!("{}: {}", prefix, reason),
        None => prefix.to_string(),
    }
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    /// Shorthand for a protocol violation with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        StreamError::Protocol(msg.into())
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl From<StreamError> for std::io::Error {
    fn from(e: StreamError) -> Self {
        let kind = match e {
            StreamError::Canceled(_) | StreamError::Aborted(_) => std::io::ErrorKind::Interrupted,
            StreamError::Closed | StreamError::Closing | StreamError::Terminated => {
                std::io::ErrorKind::BrokenPipe
            }
            StreamError::AllocationFailure { .. } => std::io::ErrorKind::OutOfMemory,
            StreamError::Range { .. } => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use chunked_streams::impl_stream_error_from;
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_conversions_work() {
        let _: StreamError = "error message".into();
        let _: StreamError = String::from("error").into();

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let _: StreamError = io_err.into();

        #[derive(Debug)]
        struct CustomError;
        impl fmt::Display for CustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "custom error")
            }
        }
        impl Error for CustomError {}

        let _: StreamError = StreamError::other(CustomError);
    }

    #[test]
    fn test_question_mark_works() -> Result<(), Box<dyn Error>> {
        fn returns_stream_error() -> Result<(), StreamError> {
            Err("stream error".into())
        }

        assert!(returns_stream_error().is_err());
        Ok(())
    }

    #[test]
    fn test_reason_is_rendered() {
        let err = StreamError::Aborted(Some("disk full".into()));
        assert_eq!(err.to_string(), "Stream was aborted: disk full");
        assert_eq!(StreamError::Canceled(None).to_string(), "Stream was canceled");

        let range = StreamError::Range {
            written: 9,
            view_len: 4,
        };
        assert_eq!(
            range.to_string(),
            "bytes written (9) exceed view length (4)"
        );
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let io: std::io::Error = StreamError::Closed.into();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);

        let io: std::io::Error = StreamError::AllocationFailure { requested: 1 }.into();
        assert_eq!(io.kind(), std::io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_macro_usage_example() {
        #[derive(Debug)]
        struct UserCustomError(String);
        impl fmt::Display for UserCustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "User error: {}", self.0)
            }
        }
        impl Error for UserCustomError {}

        crate::impl_stream_error_from!(UserCustomError);

        fn user_function() -> Result<(), StreamError> {
            fn might_fail() -> Result<(), UserCustomError> {
                Err(UserCustomError("something went wrong".to_string()))
            }
            might_fail()?;
            Ok(())
        }

        let err = user_function().unwrap_err();
        assert_eq!(err.to_string(), "User error: something went wrong");
    }
}
