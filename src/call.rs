//! The unit of work routed through the executor.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, IF_MODIFIED_SINCE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::time::SystemTime;
use url::Url;

/// The media type of JSON-API documents.
pub const JSON_API_MEDIA_TYPE: &str = "application/vnd.api+json";

/// One logical API operation: method, resolved URL, headers and an optional
/// pre-serialized body.
///
/// A call is built for exactly one operation. The body is held as [`Bytes`] so each
/// retry attempt can resend it without copying.
///
/// # Examples
///
/// ```
/// use tfe_core::Call;
/// use http::Method;
/// use url::Url;
///
/// let url = Url::parse("https://app.terraform.io/api/v2/organizations/acme/workspaces")?;
/// let call = Call::new(Method::GET, url)
///     .query("page[size]", "20")
///     .header("X-Request-Source", "inventory")?;
///
/// assert!(call.is_idempotent());
/// assert_eq!(call.url.query(), Some("page%5Bsize%5D=20"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct Call {
    /// The HTTP method.
    pub method: Method,

    /// The fully resolved request URL.
    pub url: Url,

    /// Request headers.
    pub headers: HeaderMap,

    /// The serialized request body, if any.
    pub body: Option<Bytes>,

    idempotent: bool,
}

impl Call {
    /// Creates a call with no headers and no body.
    ///
    /// Idempotency defaults from the method: GET, HEAD, OPTIONS, TRACE, PUT and DELETE
    /// are idempotent, POST and PATCH are not.
    pub fn new(method: Method, url: Url) -> Self {
        let idempotent = matches!(
            method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
        );
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            idempotent,
        }
    }

    /// Adds a header, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, crate::Error> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.url
            .query_pairs_mut()
            .append_pair(key.as_ref(), value.as_ref());
        self
    }

    /// Appends several query parameters.
    pub fn query_pairs<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        {
            let mut pairs = self.url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key.as_ref(), value.as_ref());
            }
        }
        self
    }

    /// Serializes `body` as the request payload with the JSON-API media type.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SerializationFailed`] if `body` cannot be serialized.
    pub fn json_api_body<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, crate::Error> {
        self.serialized_body(body, JSON_API_MEDIA_TYPE)
    }

    /// Serializes `body` as a plain `application/json` payload.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SerializationFailed`] if `body` cannot be serialized.
    pub fn json_body<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, crate::Error> {
        self.serialized_body(body, "application/json")
    }

    fn serialized_body<T: Serialize + ?Sized>(
        mut self,
        body: &T,
        content_type: &'static str,
    ) -> Result<Self, crate::Error> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| crate::Error::SerializationFailed(e.to_string()))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Sets a raw, already-encoded body.
    pub fn raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds an `If-Modified-Since` header for a conditional fetch.
    pub fn if_modified_since(mut self, since: SystemTime) -> Self {
        let date = httpdate::fmt_http_date(since);
        if let Ok(value) = HeaderValue::try_from(date) {
            self.headers.insert(IF_MODIFIED_SINCE, value);
        }
        self
    }

    /// Marks whether repeating this call has the same effect as sending it once.
    ///
    /// Only idempotent calls are retried after failures that may have reached the
    /// server.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Returns `true` if the call may be safely repeated.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}
