//! Error types for the events crate.

/// Errors from [`crate::init_tracing`].
#[derive(Debug, thiserror::Error)]
pub enum TracingInitError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    /// A global subscriber is already installed.
    #[error("tracing already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;

    #[test]
    fn test_filter_error_message() {
        let err: TracingInitError = EnvFilter::try_new("stowage=notalevel")
            .map(|_| ())
            .unwrap_err()
            .into();
        assert!(err.to_string().starts_with("invalid log filter"));
    }
}
