//! Error data carried by error envelopes and the mapping to typed failures

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;

/// Structured error data carried in the payload of an error envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Error code
    pub code: i32,
    /// Human-readable error message
    pub message: String,
}

impl ErrorData {
    /// Create new error data
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Typed failure produced by a service and carried across the wire.
///
/// Every variant keeps the code it was built from, so an unrecognized code
/// survives a round trip through [`ServiceError::Internal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The request was malformed
    #[error("{message}")]
    BadRequest {
        /// Wire error code
        code: i32,
        /// Error message
        message: String,
    },

    /// The caller is not authenticated
    #[error("{message}")]
    Unauthorized {
        /// Wire error code
        code: i32,
        /// Error message
        message: String,
    },

    /// The caller is not allowed to call this service
    #[error("{message}")]
    Forbidden {
        /// Wire error code
        code: i32,
        /// Error message
        message: String,
    },

    /// No handler is available for the request
    #[error("{message}")]
    ServiceUnavailable {
        /// Wire error code
        code: i32,
        /// Error message
        message: String,
    },

    /// The service failed, or the code was not recognized
    #[error("{message}")]
    Internal {
        /// Wire error code
        code: i32,
        /// Error message
        message: String,
    },
}

impl ServiceError {
    /// Code of [`ServiceError::BadRequest`]
    pub const BAD_REQUEST: i32 = 400;
    /// Code of [`ServiceError::Unauthorized`]
    pub const UNAUTHORIZED: i32 = 401;
    /// Code of [`ServiceError::Forbidden`]
    pub const FORBIDDEN: i32 = 403;
    /// Code of [`ServiceError::Internal`]
    pub const INTERNAL: i32 = 500;
    /// Code of [`ServiceError::ServiceUnavailable`]
    pub const SERVICE_UNAVAILABLE: i32 = 503;

    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: Self::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: Self::UNAUTHORIZED,
            message: message.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            code: Self::FORBIDDEN,
            message: message.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            code: Self::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    /// Create an internal error with an explicit code
    pub fn internal(code: i32, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    /// Wire error code
    pub fn code(&self) -> i32 {
        match self {
            Self::BadRequest { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::Forbidden { code, .. }
            | Self::ServiceUnavailable { code, .. }
            | Self::Internal { code, .. } => *code,
        }
    }

    /// Error message
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Unauthorized { message, .. }
            | Self::Forbidden { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }
}

impl From<&ServiceError> for ErrorData {
    fn from(error: &ServiceError) -> Self {
        ErrorData::new(error.code(), error.message())
    }
}

/// Converts between wire error data and typed failures.
///
/// Implementations must be total and deterministic in both directions.
pub trait ErrorMapper: Send + Sync {
    /// Map wire error data to a typed failure
    fn to_error(&self, data: ErrorData) -> ServiceError;

    /// Map any failure to wire error data
    fn to_error_data(&self, error: &(dyn StdError + 'static)) -> ErrorData;
}

/// Error mapper with the closed code table of the gateway protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorMapper;

impl ErrorMapper for DefaultErrorMapper {
    fn to_error(&self, data: ErrorData) -> ServiceError {
        let ErrorData { code, message } = data;
        match code {
            ServiceError::BAD_REQUEST => ServiceError::BadRequest { code, message },
            ServiceError::UNAUTHORIZED => ServiceError::Unauthorized { code, message },
            ServiceError::FORBIDDEN => ServiceError::Forbidden { code, message },
            ServiceError::SERVICE_UNAVAILABLE => {
                ServiceError::ServiceUnavailable { code, message }
            }
            _ => ServiceError::Internal { code, message },
        }
    }

    fn to_error_data(&self, error: &(dyn StdError + 'static)) -> ErrorData {
        // A service error wrapped in context keeps its own code
        let mut current = Some(error);
        while let Some(err) = current {
            if let Some(service_error) = err.downcast_ref::<ServiceError>() {
                return ErrorData::from(service_error);
            }
            current = err.source();
        }
        ErrorData::new(ServiceError::INTERNAL, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Error)]
    #[error("wrapped: {source}")]
    struct Wrapper {
        #[source]
        source: ServiceError,
    }

    #[test]
    fn test_known_codes_map_to_kinds() {
        let mapper = DefaultErrorMapper;

        assert!(matches!(
            mapper.to_error(ErrorData::new(400, "bad")),
            ServiceError::BadRequest { code: 400, .. }
        ));
        assert!(matches!(
            mapper.to_error(ErrorData::new(401, "who")),
            ServiceError::Unauthorized { .. }
        ));
        assert!(matches!(
            mapper.to_error(ErrorData::new(403, "no")),
            ServiceError::Forbidden { .. }
        ));
        assert!(matches!(
            mapper.to_error(ErrorData::new(503, "down")),
            ServiceError::ServiceUnavailable { .. }
        ));
        assert!(matches!(
            mapper.to_error(ErrorData::new(500, "boom")),
            ServiceError::Internal { code: 500, .. }
        ));
    }

    #[test]
    fn test_unknown_code_falls_back_to_internal() {
        let error = DefaultErrorMapper.to_error(ErrorData::new(418, "teapot"));
        assert_eq!(error, ServiceError::internal(418, "teapot"));
        assert_eq!(error.to_string(), "teapot");
    }

    #[test]
    fn test_service_error_to_error_data() {
        let error = ServiceError::forbidden("nope");
        let data = DefaultErrorMapper.to_error_data(&error);
        assert_eq!(data, ErrorData::new(403, "nope"));
    }

    #[test]
    fn test_foreign_error_maps_to_internal() {
        let error = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let data = DefaultErrorMapper.to_error_data(&error);
        assert_eq!(data, ErrorData::new(500, "disk on fire"));
    }

    #[test]
    fn test_nested_service_error_keeps_code() {
        let error = Wrapper {
            source: ServiceError::unauthorized("token expired"),
        };
        let data = DefaultErrorMapper.to_error_data(&error);
        assert_eq!(data, ErrorData::new(401, "token expired"));
    }

    proptest! {
        #[test]
        fn test_mapping_roundtrip_keeps_code_and_message(
            code in any::<i32>(),
            message in "[a-zA-Z0-9 ]{0,32}"
        ) {
            let mapper = DefaultErrorMapper;
            let error = mapper.to_error(ErrorData::new(code, message.clone()));
            prop_assert_eq!(error.code(), code);
            prop_assert_eq!(error.message(), message.as_str());

            let data = mapper.to_error_data(&error);
            prop_assert_eq!(data, ErrorData::new(code, message));
        }
    }
}
