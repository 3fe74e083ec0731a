//! Response decoding.
//!
//! What happens to a successful response body is chosen by the caller's [`Target`]:
//! nothing, a verbatim copy into a byte sink, or a JSON-API document mapped into a
//! model. The conditional-GET variant, for endpoints that answer with bare JSON and
//! may reply 304, lives in [`decode_conditional`].

use crate::classify;
use crate::context::Context;
use crate::jsonapi::{Document, DocumentSink};
use crate::transport::ResponseBody;
use crate::{Error, Result};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::SystemTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Where a response body goes.
///
/// # Examples
///
/// ```no_run
/// use tfe_core::{Call, Client, Context, Target};
/// use tfe_core::jsonapi::{Document, Single};
///
/// # async fn example(client: Client, ctx: Context) -> Result<(), tfe_core::Error> {
/// // Raw state file, copied verbatim.
/// let mut state = Vec::new();
/// let call = client.call(http::Method::GET, "state-versions/sv-123/download")?;
/// client.execute(&ctx, call, Target::Raw(&mut state)).await?;
///
/// // JSON-API document mapped into a model.
/// let mut workspace = Single::<serde_json::Value>::default();
/// let call = client.call(http::Method::GET, "workspaces/ws-123")?;
/// client.execute(&ctx, call, Target::Document(&mut workspace)).await?;
///
/// // No body expected.
/// let call = client.call(http::Method::DELETE, "workspaces/ws-123")?;
/// client.execute(&ctx, call, Target::None).await?;
/// # Ok(())
/// # }
/// ```
pub enum Target<'a> {
    /// Do not read the body.
    None,
    /// Copy the body verbatim.
    Raw(&'a mut (dyn AsyncWrite + Unpin + Send)),
    /// Parse the body as a JSON-API document into the sink.
    Document(&'a mut dyn DocumentSink),
}

impl fmt::Debug for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::None => f.write_str("Target::None"),
            Target::Raw(_) => f.write_str("Target::Raw(..)"),
            Target::Document(_) => f.write_str("Target::Document(..)"),
        }
    }
}

/// The result of a conditional fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The server answered 304; the target was left untouched.
    NotModified,
    /// The target was replaced with fresh content.
    Modified {
        /// The `Last-Modified` header, for the next `If-Modified-Since`.
        last_modified: Option<SystemTime>,
    },
}

/// Decodes a successful response body into `target`.
///
/// Every read races against `ctx`.
pub async fn decode(
    ctx: &Context,
    status: StatusCode,
    body: &mut ResponseBody,
    target: Target<'_>,
) -> Result<()> {
    match target {
        Target::None => Ok(()),
        Target::Raw(writer) => copy_raw(ctx, body, writer).await,
        Target::Document(sink) => {
            let bytes = read_body(ctx, body).await?;
            let document = parse_document(status, &bytes)?;
            classify::embedded_errors(status, &document)?;
            sink.fill(document)
                .map_err(|e| deserialization_failed(status, &bytes, e))
        }
    }
}

/// Decodes a conditional-GET response with plain JSON semantics.
///
/// 304 leaves `target` untouched. Statuses outside `[200, 400)` are
/// [`Error::UnexpectedStatus`] whatever the body says. Anything else is decoded as
/// plain JSON into `target`.
pub async fn decode_conditional<T: DeserializeOwned>(
    ctx: &Context,
    status: StatusCode,
    headers: &HeaderMap,
    body: &mut ResponseBody,
    target: &mut T,
) -> Result<Freshness> {
    if status == StatusCode::NOT_MODIFIED {
        return Ok(Freshness::NotModified);
    }
    if !(200..400).contains(&status.as_u16()) {
        return Err(Error::UnexpectedStatus { status });
    }

    let bytes = read_body(ctx, body).await?;
    *target = serde_json::from_slice(&bytes).map_err(|e| deserialization_failed(status, &bytes, e))?;

    let last_modified = headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());
    Ok(Freshness::Modified { last_modified })
}

/// Reads the whole body, observing cancellation.
pub(crate) async fn read_body(ctx: &Context, body: &mut ResponseBody) -> Result<Vec<u8>> {
    Ok(ctx.run(body.bytes()).await??)
}

async fn copy_raw(
    ctx: &Context,
    body: &mut ResponseBody,
    writer: &mut (dyn AsyncWrite + Unpin + Send),
) -> Result<()> {
    while let Some(chunk) = ctx.run(body.chunk()).await? {
        let chunk = chunk?;
        ctx.run(writer.write_all(&chunk))
            .await?
            .map_err(Error::RawSink)?;
    }
    ctx.run(writer.flush()).await?.map_err(Error::RawSink)
}

fn parse_document(status: StatusCode, bytes: &[u8]) -> Result<Document> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Document::default());
    }
    serde_json::from_slice(bytes).map_err(|e| deserialization_failed(status, bytes, e))
}

fn deserialization_failed(status: StatusCode, bytes: &[u8], error: serde_json::Error) -> Error {
    let raw_response = String::from_utf8_lossy(bytes).into_owned();
    tracing::error!(
        error = %error,
        raw_response = %raw_response,
        "Failed to deserialize response"
    );
    Error::DeserializationFailed {
        raw_response,
        serde_error: error.to_string(),
        status,
    }
}
