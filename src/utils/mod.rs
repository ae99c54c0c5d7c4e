//! The `utils` module provides shared pieces used across `popmq`:
//! the error types and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result, StorageError};

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, StorageError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn storage_errors_convert_into_broker_errors() {
        let err: BrokerError = StorageError::Unavailable("disk gone".into()).into();
        assert!(matches!(err, BrokerError::Storage(_)));
        assert_eq!(err.to_string(), "storage failure: store unavailable: disk gone");
    }

    #[test]
    fn unknown_tag_message_names_queue_and_tag() {
        let err = BrokerError::UnknownTag {
            queue: "orders".into(),
            tag: 7,
        };
        assert_eq!(err.to_string(), "unknown delivery tag 7 on queue 'orders'");
    }
}
