//! The request executor.
//!
//! [`Client`] is the single entry point every API call goes through. It admits the
//! call through the client's [`RateLimiter`], sends it under the [`RetryPolicy`],
//! classifies the response status and decodes the body into the caller's [`Target`].
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    call::{Call, JSON_API_MEDIA_TYPE},
    classify::classify,
    context::Context,
    decode::{self, Freshness, Target},
    jsonapi::FromDocument,
    rate_limit::RateLimiter,
    retry::RetryPolicy,
    transport::{RawResponse, ReqwestTransport, Transport},
    Error, Result,
};
use http::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// The address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "https://app.terraform.io";

/// The API path prefix used when none is configured.
pub const DEFAULT_BASE_PATH: &str = "/api/v2/";

/// Metadata a server reports on its ping endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMeta {
    /// `TFP-API-Version`
    pub api_version: Option<String>,
    /// `X-TFE-Version`
    pub tfe_version: Option<String>,
    /// `TFP-AppName`
    pub app_name: Option<String>,
    /// `X-RateLimit-Limit`
    pub rate_limit: Option<String>,
}

impl RemoteMeta {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Self {
            api_version: header("tfp-api-version"),
            tfe_version: header("x-tfe-version"),
            app_name: header("tfp-appname"),
            rate_limit: header("x-ratelimit-limit"),
        }
    }
}

/// A Terraform Cloud/Enterprise API client.
///
/// The client is cheap to clone and meant to be shared; clones share one connection
/// pool and one rate limiter.
///
/// # Examples
///
/// ```no_run
/// use tfe_core::{Client, Context, RetryPolicy};
/// use tfe_core::jsonapi::Single;
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Debug, Default, Deserialize)]
/// #[serde(default, rename_all = "kebab-case")]
/// struct Workspace {
///     name: String,
///     auto_apply: bool,
/// }
///
/// # async fn example() -> Result<(), tfe_core::Error> {
/// let client = Client::builder()
///     .token("my-api-token")?
///     .retry_policy(RetryPolicy::default().max_attempts(5))
///     .rate_limit(30.0, 10)
///     .build()?;
///
/// let ctx = Context::background().with_timeout(Duration::from_secs(30));
/// let call = client.call(http::Method::GET, "workspaces/ws-123")?;
/// let workspace: Single<Workspace> = client.fetch(&ctx, call).await?;
/// println!("{} auto-apply={}", workspace.attributes.name, workspace.attributes.auto_apply);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: Url,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    limiter: RateLimiter,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The base URL calls are resolved against, e.g. `https://app.terraform.io/api/v2/`.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// The client's rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Starts a call to `path`, resolved against the base URL, carrying the client's
    /// default headers. A leading slash on `path` is ignored.
    ///
    /// `path` must already be escaped by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `path` does not form a valid URL.
    pub fn call(&self, method: Method, path: &str) -> Result<Call> {
        self.call_to(method, self.inner.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Starts a call to `path` resolved against the server root rather than the API
    /// base path, for endpoints such as `/api/meta/ip-ranges`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `path` does not form a valid URL.
    pub fn call_from_root(&self, method: Method, path: &str) -> Result<Call> {
        let path = format!("/{}", path.trim_start_matches('/'));
        self.call_to(method, self.inner.base_url.join(&path)?)
    }

    fn call_to(&self, method: Method, url: Url) -> Result<Call> {
        let mut call = Call::new(method, url);
        call.headers = self.inner.default_headers.clone();
        Ok(call)
    }

    /// Executes `call` and decodes a successful response into `target`.
    ///
    /// The call waits for a rate-limit token, is sent with retries, and its response
    /// status is classified; non-success statuses return an error without touching
    /// `target`. The response body is released on every path.
    ///
    /// If `ctx` is cancelled or its deadline passes at any point, the context's error
    /// is returned in preference to whatever else was in flight.
    pub async fn execute(&self, ctx: &Context, call: Call, target: Target<'_>) -> Result<()> {
        self.execute_inner(ctx, &call, target)
            .await
            .map_err(|e| prefer_cancellation(ctx, e))
    }

    async fn execute_inner(&self, ctx: &Context, call: &Call, target: Target<'_>) -> Result<()> {
        let mut response = self.send(ctx, call).await?;

        if !response.status.is_success() {
            let body = match decode::read_body(ctx, &mut response.body).await {
                Ok(body) => body,
                Err(e @ Error::Cancelled(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        status = response.status.as_u16(),
                        method = %call.method,
                        url = %call.url,
                        "Failed to read error response body"
                    );
                    Vec::new()
                }
            };
            return classify(response.status, &body);
        }

        decode::decode(ctx, response.status, &mut response.body, target).await
    }

    /// Executes `call` and returns the decoded document model.
    pub async fn fetch<T>(&self, ctx: &Context, call: Call) -> Result<T>
    where
        T: FromDocument + Default + Send,
    {
        let mut model = T::default();
        self.execute(ctx, call, Target::Document(&mut model)).await?;
        Ok(model)
    }

    /// Executes a conditional GET against an endpoint that answers with plain JSON.
    ///
    /// A 304 leaves `target` untouched and returns [`Freshness::NotModified`]. Any
    /// status outside `[200, 400)` is [`Error::UnexpectedStatus`]; the JSON-API error
    /// classification and its sentinels do not apply here.
    ///
    /// ```no_run
    /// use tfe_core::{Client, Context, Freshness};
    /// use serde::Deserialize;
    ///
    /// #[derive(Debug, Default, Deserialize)]
    /// struct IpRanges {
    ///     api: Vec<String>,
    ///     notifications: Vec<String>,
    ///     sentinel: Vec<String>,
    ///     vcs: Vec<String>,
    /// }
    ///
    /// # async fn example(client: Client, last: std::time::SystemTime) -> Result<(), tfe_core::Error> {
    /// let ctx = Context::background();
    /// let mut ranges = IpRanges::default();
    /// let call = client
    ///     .call_from_root(http::Method::GET, "/api/meta/ip-ranges")?
    ///     .if_modified_since(last);
    /// match client.execute_conditional(&ctx, call, &mut ranges).await? {
    ///     Freshness::NotModified => println!("unchanged"),
    ///     Freshness::Modified { .. } => println!("api ranges: {:?}", ranges.api),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_conditional<T>(
        &self,
        ctx: &Context,
        call: Call,
        target: &mut T,
    ) -> Result<Freshness>
    where
        T: DeserializeOwned,
    {
        self.execute_conditional_inner(ctx, &call, target)
            .await
            .map_err(|e| prefer_cancellation(ctx, e))
    }

    async fn execute_conditional_inner<T>(
        &self,
        ctx: &Context,
        call: &Call,
        target: &mut T,
    ) -> Result<Freshness>
    where
        T: DeserializeOwned,
    {
        let mut response = self.send(ctx, call).await?;
        decode::decode_conditional(
            ctx,
            response.status,
            &response.headers,
            &mut response.body,
            target,
        )
        .await
    }

    /// Fetches the server's ping endpoint, returns the metadata it advertises and
    /// reconfigures the client's rate limiter from the advertised `X-RateLimit-Limit`.
    pub async fn ping(&self, ctx: &Context) -> Result<RemoteMeta> {
        let call = self.call(Method::GET, "ping")?;
        let meta = self
            .ping_inner(ctx, &call)
            .await
            .map_err(|e| prefer_cancellation(ctx, e))?;

        self.inner
            .limiter
            .reconfigure_from_advertised_limit(meta.rate_limit.as_deref());
        tracing::info!(
            api_version = meta.api_version.as_deref().unwrap_or("unknown"),
            rate_limit = meta.rate_limit.as_deref().unwrap_or("unlimited"),
            "Configured client from remote metadata"
        );
        Ok(meta)
    }

    async fn ping_inner(&self, ctx: &Context, call: &Call) -> Result<RemoteMeta> {
        let mut response = self.send(ctx, call).await?;
        if !response.status.is_success() {
            let body = decode::read_body(ctx, &mut response.body).await?;
            classify(response.status, &body)?;
        }
        Ok(RemoteMeta::from_headers(&response.headers))
    }

    /// Admits and sends `call`, returning the raw response envelope.
    async fn send(&self, ctx: &Context, call: &Call) -> Result<RawResponse> {
        let start_time = Instant::now();

        self.inner.limiter.acquire(ctx).await?;

        let response = self
            .inner
            .retry_policy
            .send(ctx, self.inner.transport.as_ref(), call)
            .await
            .map_err(|e| {
                tracing::warn!(
                    error = %e,
                    method = %call.method,
                    url = %call.url,
                    "Request failed"
                );
                e
            })?;

        tracing::info!(
            status = response.status.as_u16(),
            method = %call.method,
            url = %call.url,
            latency_ms = start_time.elapsed().as_millis() as u64,
            "Received HTTP response"
        );

        Ok(response)
    }
}

/// Replaces a transport-level failure with the context's error once the context is done.
fn prefer_cancellation(ctx: &Context, error: Error) -> Error {
    match (ctx.err(), &error) {
        (
            Some(cause),
            Error::Transport(_) | Error::RetriesExhausted { .. } | Error::AmbiguousWrite { .. },
        ) => Error::Cancelled(cause),
        _ => error,
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use tfe_core::{ClientBuilder, RetryPolicy};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), tfe_core::Error> {
/// let client = ClientBuilder::from_env()?
///     .timeout(Duration::from_secs(30))
///     .retry_policy(RetryPolicy::default().max_attempts(10))
///     .user_agent("inventory-sync/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    address: Option<Url>,
    base_path: String,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    limiter: Option<RateLimiter>,
    timeout: Option<Duration>,
    http_client: Option<reqwest::Client>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static(JSON_API_MEDIA_TYPE));
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tfe-core/", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            address: None,
            base_path: DEFAULT_BASE_PATH.to_string(),
            default_headers,
            retry_policy: RetryPolicy::default(),
            limiter: None,
            timeout: None,
            http_client: None,
            transport: None,
        }
    }

    /// Creates a builder configured from `TFE_ADDRESS` and `TFE_TOKEN`.
    ///
    /// Unset variables leave the defaults in place.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an invalid address or token.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::new();
        if let Some(address) = non_empty_var("TFE_ADDRESS") {
            builder = builder.address(address)?;
        }
        if let Some(token) = non_empty_var("TFE_TOKEN") {
            builder = builder.token(token)?;
        }
        Ok(builder)
    }

    /// Sets the server address, e.g. `https://tfe.example.com`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn address(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.address = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Sets the API path prefix. Defaults to `/api/v2/`.
    pub fn base_path(mut self, base_path: impl AsRef<str>) -> Self {
        let trimmed = base_path.as_ref().trim_matches('/');
        self.base_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        };
        self
    }

    /// Sets the API token sent as a bearer credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not a valid header value.
    pub fn token(mut self, token: impl AsRef<str>) -> Result<Self> {
        let mut value = HeaderValue::try_from(format!("Bearer {}", token.as_ref()))
            .map_err(|e| Error::ConfigurationError(format!("Invalid token: {}", e)))?;
        value.set_sensitive(true);
        self.default_headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    /// Adds a default header that will be included in all calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the `User-Agent` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn user_agent(self, user_agent: impl AsRef<str>) -> Result<Self> {
        self.default_header(USER_AGENT.as_str(), user_agent)
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Limits the client to `rate` calls per second with bursts of `burst`.
    pub fn rate_limit(mut self, rate: f64, burst: usize) -> Self {
        self.limiter = Some(RateLimiter::new(rate, burst));
        self
    }

    /// Uses a preconfigured rate limiter.
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Sets the timeout of each physical attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Uses an existing `reqwest::Client` (for custom TLS, proxies or pooling).
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Replaces the transport entirely. Takes precedence over
    /// [`http_client`](ClientBuilder::http_client) and [`timeout`](ClientBuilder::timeout).
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL cannot be formed or the HTTP client cannot be
    /// built.
    pub fn build(self) -> Result<Client> {
        let address = match self.address {
            Some(address) => address,
            None => Url::parse(DEFAULT_ADDRESS)?,
        };
        let base_url = address.join(&self.base_path)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let http_client = match self.http_client {
                    Some(client) => client,
                    None => reqwest::Client::builder().build().map_err(|e| {
                        Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
                    })?,
                };
                Arc::new(ReqwestTransport::new(http_client).with_timeout(self.timeout))
            }
        };

        tracing::debug!(base_url = %base_url, "Built API client");

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                base_url,
                default_headers: self.default_headers,
                retry_policy: self.retry_policy,
                limiter: self.limiter.unwrap_or_default(),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}
