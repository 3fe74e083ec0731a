//! Error types for API calls.
//!
//! Every failure mode of a call surfaces as one [`Error`] variant. Cancellation is
//! reported in preference to anything else that happened at the same time, and the
//! two well-known statuses callers branch on (401 and 404) are remapped to the
//! [`Error::Unauthorized`] and [`Error::NotFound`] sentinels.

use crate::context::ContextError;
use crate::jsonapi::ApiError;
use crate::transport::TransportError;
use http::StatusCode;

/// The main error type for API calls.
///
/// # Examples
///
/// ```no_run
/// use tfe_core::{Client, Context, Error};
/// use tfe_core::jsonapi::Document;
///
/// # async fn example(client: Client) -> Result<(), Error> {
/// let ctx = Context::background();
/// match client.fetch::<Document>(&ctx, client.call(http::Method::GET, "workspaces/ws-123")?).await {
///     Ok(doc) => println!("found {:?}", doc.data),
///     Err(Error::NotFound) => println!("no such workspace"),
///     Err(Error::Status { status, errors }) => {
///         for e in &errors {
///             eprintln!("{}: {}", status, e);
///         }
///     }
///     Err(e) => return Err(e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The call's context was cancelled or its deadline passed.
    #[error("{0}")]
    Cancelled(#[from] ContextError),

    /// A network-level failure on the only attempt made.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every permitted attempt failed at the network level.
    ///
    /// Callers handle this exactly like [`Error::Transport`]; it exists so logs
    /// and metrics can tell a retry budget was spent.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// The number of physical attempts made
        attempts: usize,
        /// The last transport error observed
        last_error: TransportError,
    },

    /// A non-idempotent call failed in a way that leaves it unknown whether the
    /// server applied it. The call was not retried.
    #[error("outcome of non-idempotent request is unknown: {cause}")]
    AmbiguousWrite {
        /// The transport failure that interrupted the exchange
        #[source]
        cause: TransportError,
    },

    /// The server answered with a non-success status and a JSON-API error document.
    ///
    /// All error objects from the document are preserved in order.
    #[error("HTTP error {status}: {}", join_api_errors(.errors))]
    Status {
        /// The HTTP status code
        status: StatusCode,
        /// Every error object of the response
        errors: Vec<ApiError>,
    },

    /// The server answered with a status outside the accepted range and no
    /// structured error document.
    #[error("unexpected status code: {status}")]
    UnexpectedStatus {
        /// The HTTP status code
        status: StatusCode,
    },

    /// The server answered 401.
    #[error("unauthorized")]
    Unauthorized,

    /// The server answered 404.
    #[error("resource not found")]
    NotFound,

    /// The exchange succeeded but the body did not parse into the expected format.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Writing the body into a raw sink failed.
    #[error("failed to write response body: {0}")]
    RawSink(#[source] std::io::Error),

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

fn join_api_errors(errors: &[ApiError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Returns `true` if the call was cancelled or ran out of time.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Returns `true` for the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Returns `true` for the unauthorized sentinel.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. }
            | Error::UnexpectedStatus { status }
            | Error::DeserializationFailed { status, .. } => Some(*status),
            Error::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            Error::NotFound => Some(StatusCode::NOT_FOUND),
            _ => None,
        }
    }

    /// Returns the JSON-API error objects carried by a status error.
    pub fn api_errors(&self) -> &[ApiError] {
        match self {
            Error::Status { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Returns `true` if any carried error object has the given stable `code`.
    ///
    /// Branch on codes rather than on titles or details: codes are part of the API
    /// contract, message text is not.
    ///
    /// ```
    /// use tfe_core::Error;
    /// use tfe_core::jsonapi::ApiError;
    ///
    /// let err = Error::Status {
    ///     status: http::StatusCode::FORBIDDEN,
    ///     errors: vec![ApiError {
    ///         code: Some("namespace-not-authorized".to_string()),
    ///         ..Default::default()
    ///     }],
    /// };
    /// assert!(err.has_api_error_code("namespace-not-authorized"));
    /// assert!(!err.has_api_error_code("invalid-attribute"));
    /// ```
    pub fn has_api_error_code(&self, code: &str) -> bool {
        self.api_errors()
            .iter()
            .any(|e| e.code.as_deref() == Some(code))
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }
}

/// A specialized `Result` type for API calls.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(title: &str, pointer: &str) -> ApiError {
        ApiError {
            status: Some("422".to_string()),
            title: Some(title.to_string()),
            source: Some(crate::jsonapi::ErrorSource {
                pointer: Some(pointer.to_string()),
                parameter: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_display_includes_every_sub_error() {
        let err = Error::Status {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            errors: vec![
                api_error("invalid name", "/data/attributes/name"),
                api_error("invalid version", "/data/attributes/terraform-version"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("invalid name (/data/attributes/name)"));
        assert!(message.contains("invalid version (/data/attributes/terraform-version)"));
        assert_eq!(err.api_errors().len(), 2);
    }

    #[test]
    fn test_sentinel_statuses() {
        assert_eq!(Error::NotFound.status(), Some(StatusCode::NOT_FOUND));
        assert!(Error::NotFound.is_not_found());
        assert!(Error::Unauthorized.is_unauthorized());
        assert!(!Error::Unauthorized.is_not_found());
    }

    #[test]
    fn test_cancelled_from_context_error() {
        let err: Error = ContextError::DeadlineExceeded.into();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "context deadline exceeded");
        assert_eq!(err.status(), None);
    }
}
