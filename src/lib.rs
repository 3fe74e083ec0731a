//! # tfe-core - request execution core for Terraform Cloud/Enterprise API clients
//!
//! Every API call goes through [`Client::execute`], which:
//!
//! 1. waits for a token from the client's [`RateLimiter`],
//! 2. sends the [`Call`] under the client's [`RetryPolicy`], retrying network errors,
//!    429 and 5xx with exponential backoff,
//! 3. classifies the response status, turning JSON-API error documents into
//!    [`Error::Status`] and 401/404 into the [`Error::Unauthorized`] /
//!    [`Error::NotFound`] sentinels,
//! 4. decodes the body into the caller's [`Target`]: nothing, a raw byte sink, or a
//!    JSON-API document model.
//!
//! Each step observes the call's [`Context`]: cancel it, or let its deadline pass,
//! and the call unwinds at once with the context's error.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tfe_core::{Client, Context, Error, RetryPolicy, Target};
//! use tfe_core::jsonapi::{Collection, Single};
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Debug, Default, Deserialize)]
//! #[serde(default, rename_all = "kebab-case")]
//! struct Workspace {
//!     name: String,
//!     terraform_version: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::builder()
//!         .token(std::env::var("TFE_TOKEN").unwrap_or_default())?
//!         .retry_policy(RetryPolicy::default().max_attempts(10))
//!         .build()?;
//!
//!     let ctx = Context::background().with_timeout(Duration::from_secs(30));
//!
//!     // Configure the rate limiter from what the server advertises.
//!     let meta = client.ping(&ctx).await?;
//!     println!("API version {:?}", meta.api_version);
//!
//!     let call = client
//!         .call(http::Method::GET, "organizations/acme/workspaces")?
//!         .query("page[size]", "50");
//!     let workspaces: Collection<Workspace> = client.fetch(&ctx, call).await?;
//!     for ws in &workspaces.items {
//!         println!("{} ({})", ws.attributes.name, ws.attributes.terraform_version);
//!     }
//!
//!     match client
//!         .fetch::<Single<Workspace>>(&ctx, client.call(http::Method::GET, "workspaces/ws-missing")?)
//!         .await
//!     {
//!         Err(Error::NotFound) => println!("workspace is gone"),
//!         other => println!("{:?}", other.map(|ws| ws.id)),
//!     }
//!
//!     let call = client.call(http::Method::POST, "workspaces/ws-123/actions/lock")?;
//!     client.execute(&ctx, call, Target::None).await?;
//!     Ok(())
//! }
//! ```

mod call;
mod classify;
mod client;
mod context;
mod decode;
mod error;
pub mod jsonapi;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use call::{Call, JSON_API_MEDIA_TYPE};
pub use classify::classify;
pub use client::{Client, ClientBuilder, RemoteMeta, DEFAULT_ADDRESS, DEFAULT_BASE_PATH};
pub use context::{Context, ContextError};
pub use decode::{decode, decode_conditional, Freshness, Target};
pub use error::{Error, Result};
pub use rate_limit::RateLimiter;
pub use retry::{RetryPolicy, RetryPredicate};
