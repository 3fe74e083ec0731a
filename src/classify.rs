//! Status classification.

use crate::jsonapi::{ApiError, Document};
use crate::Error;
use http::StatusCode;

/// Maps a response status and body to success or a typed error.
///
/// - 2xx is success.
/// - 401 and 404 become the [`Error::Unauthorized`] and [`Error::NotFound`] sentinels.
/// - Any other status yields [`Error::Status`] with every error object of the
///   body's JSON-API `errors` array, or [`Error::UnexpectedStatus`] when the body
///   is empty, unparseable, or has no error objects.
pub fn classify(status: StatusCode, body: &[u8]) -> Result<(), Error> {
    if status.is_success() {
        return Ok(());
    }

    match status {
        StatusCode::UNAUTHORIZED => return Err(Error::Unauthorized),
        StatusCode::NOT_FOUND => return Err(Error::NotFound),
        _ => {}
    }

    match parse_errors(body) {
        Some(errors) => {
            if status.is_client_error() {
                tracing::error!(
                    status = status.as_u16(),
                    errors = errors.len(),
                    "Client error (4xx)"
                );
            } else {
                tracing::warn!(
                    status = status.as_u16(),
                    errors = errors.len(),
                    "Server error"
                );
            }
            Err(Error::Status { status, errors })
        }
        None => {
            tracing::warn!(
                status = status.as_u16(),
                body_len = body.len(),
                "Unexpected status without error document"
            );
            Err(Error::UnexpectedStatus { status })
        }
    }
}

/// Classifies a 2xx document that carries only `errors` and no primary data.
pub(crate) fn embedded_errors(status: StatusCode, document: &Document) -> Result<(), Error> {
    if document.data.is_none() && !document.errors.is_empty() {
        return Err(Error::Status {
            status,
            errors: document.errors.clone(),
        });
    }
    Ok(())
}

fn parse_errors(body: &[u8]) -> Option<Vec<ApiError>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let document: Document = serde_json::from_slice(body).ok()?;
    if document.errors.is_empty() {
        None
    } else {
        Some(document.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        assert!(classify(StatusCode::OK, b"").is_ok());
        assert!(classify(StatusCode::NO_CONTENT, b"").is_ok());
    }

    #[test]
    fn test_sentinels_ignore_body() {
        let body = br#"{"errors": [{"status": "404", "title": "not found"}]}"#;
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, body),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, b""),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn test_all_error_objects_preserved() {
        let body = br#"{"errors": [
            {"status": "422", "title": "invalid attribute", "detail": "Name is invalid",
             "source": {"pointer": "/data/attributes/name"}},
            {"status": "422", "title": "invalid attribute", "detail": "Version is invalid",
             "source": {"pointer": "/data/attributes/terraform-version"}},
            {"status": "422", "code": "agent-pool-required", "title": "invalid attribute"}
        ]}"#;

        match classify(StatusCode::UNPROCESSABLE_ENTITY, body) {
            Err(Error::Status { status, errors }) => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(errors.len(), 3);
                assert_eq!(errors[1].detail.as_deref(), Some("Version is invalid"));
                assert_eq!(errors[2].code.as_deref(), Some("agent-pool-required"));
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_to_unexpected_status() {
        let bodies: [&[u8]; 3] = [b"", b"<html>bad gateway</html>", br#"{"errors": []}"#];
        for body in bodies {
            assert!(matches!(
                classify(StatusCode::BAD_GATEWAY, body),
                Err(Error::UnexpectedStatus { status }) if status == StatusCode::BAD_GATEWAY
            ));
        }
    }

    #[test]
    fn test_embedded_errors_in_success_document() {
        let doc: Document =
            serde_json::from_str(r#"{"errors": [{"title": "partial failure"}]}"#).unwrap();
        assert!(embedded_errors(StatusCode::OK, &doc).is_err());
        assert!(embedded_errors(StatusCode::OK, &Document::default()).is_ok());
    }
}
