//! Sign-in and refresh exchanges against the backend's auth endpoints.
//!
//! Both exchanges post JSON and read back `{accessToken, refreshToken?, expiresAt?}` where
//! `expiresAt` is epoch milliseconds. Grants without an expiry are treated as valid for one hour.

// crates.io
use serde::Deserializer;
// self
use crate::{
	_prelude::*,
	auth::{AccessToken, CustomerId, RefreshToken},
	config::SessionConfig,
	error::{ConfigError, RefreshError},
	http::{self, HttpResponse, HttpTransport},
};

/// Backend path of the sign-in exchange.
pub const SIGN_IN_PATH: &str = "/api/auth/login";
/// Backend path of the refresh exchange.
pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// Boxed future returned by [`TokenExchange`] operations.
pub type ExchangeFuture<'a, T, E = Error> = Pin<Box<dyn Future<Output = Result<T, E>> + 'a + Send>>;

/// Credentials returned by a successful exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
	/// Newly issued access token.
	pub access_token: AccessToken,
	/// Refresh token, when the backend issued or rotated one.
	pub refresh_token: Option<RefreshToken>,
	/// Absolute expiry of the access token.
	pub expires_at: OffsetDateTime,
}
impl Debug for TokenGrant {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenGrant")
			.field("refresh_token", &self.refresh_token.is_some())
			.field("expires_at", &self.expires_at)
			.finish_non_exhaustive()
	}
}

/// Sign-in input: the customer identifier plus an optional credential token.
#[derive(Clone, Debug)]
pub struct SignInRequest {
	/// Customer signing in.
	pub customer_id: CustomerId,
	/// Credential proving the customer's identity, if the backend requires one.
	pub credential: Option<String>,
}
impl SignInRequest {
	/// Creates a request without a credential.
	pub fn new(customer_id: CustomerId) -> Self {
		Self { customer_id, credential: None }
	}

	/// Attaches a credential token.
	pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
		self.credential = Some(credential.into());

		self
	}
}

/// Backend exchanges that mint session credentials.
///
/// Refresh failures use [`RefreshError`] so a single outcome can be cloned to every caller
/// coalesced onto the same refresh.
pub trait TokenExchange
where
	Self: Send + Sync,
{
	/// Exchanges a customer identifier (and credential) for a new session.
	fn sign_in<'a>(&'a self, request: &'a SignInRequest) -> ExchangeFuture<'a, TokenGrant>;

	/// Exchanges a refresh token for a new access token.
	fn refresh<'a>(
		&'a self,
		refresh_token: &'a RefreshToken,
	) -> ExchangeFuture<'a, TokenGrant, RefreshError>;
}

/// [`TokenExchange`] talking to the backend over an [`HttpTransport`].
pub struct HttpTokenExchange<C>
where
	C: ?Sized + HttpTransport,
{
	config: Arc<SessionConfig>,
	transport: Arc<C>,
}
impl<C> HttpTokenExchange<C>
where
	C: ?Sized + HttpTransport,
{
	/// Default lifetime applied when the backend omits `expiresAt`.
	pub const DEFAULT_GRANT_LIFETIME: Duration = Duration::hours(1);

	/// Creates an exchange resolving endpoints against the configured base address.
	pub fn new(config: Arc<SessionConfig>, transport: Arc<C>) -> Self {
		Self { config, transport }
	}

	async fn post(&self, path: &str, body: &impl Serialize) -> Result<HttpResponse> {
		let url = self.config.endpoint(path)?;
		let payload = serde_json::to_vec(body).map_err(ConfigError::Body)?;
		let request = ::http::Request::builder()
			.method(::http::Method::POST)
			.uri(url.as_str())
			.header(::http::header::CONTENT_TYPE, "application/json")
			.header(::http::header::ACCEPT, "application/json")
			.body(payload)
			.map_err(ConfigError::from)?;

		Ok(self.transport.execute(request).await?)
	}

	fn parse_grant(response: &HttpResponse, context: &'static str) -> Result<TokenGrant> {
		let mut deserializer = serde_json::Deserializer::from_slice(response.body());
		let wire: GrantResponse = serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| Error::Decode { context, source })?;

		Ok(TokenGrant {
			access_token: AccessToken::new(wire.access_token),
			refresh_token: wire.refresh_token.filter(|token| !token.is_empty()).map(RefreshToken::new),
			expires_at: wire
				.expires_at
				.unwrap_or_else(|| OffsetDateTime::now_utc() + Self::DEFAULT_GRANT_LIFETIME),
		})
	}
}
impl<C> Clone for HttpTokenExchange<C>
where
	C: ?Sized + HttpTransport,
{
	fn clone(&self) -> Self {
		Self { config: self.config.clone(), transport: self.transport.clone() }
	}
}
impl<C> Debug for HttpTokenExchange<C>
where
	C: ?Sized + HttpTransport,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("HttpTokenExchange")
			.field("api_base_url", &self.config.api_base_url.as_str())
			.finish_non_exhaustive()
	}
}
impl<C> TokenExchange for HttpTokenExchange<C>
where
	C: ?Sized + HttpTransport,
{
	fn sign_in<'a>(&'a self, request: &'a SignInRequest) -> ExchangeFuture<'a, TokenGrant> {
		Box::pin(async move {
			let body = SignInBody {
				customer_id: request.customer_id.as_ref(),
				token: request.credential.as_deref(),
			};
			let response = self.post(SIGN_IN_PATH, &body).await?;
			let status = response.status();

			if !status.is_success() {
				return Err(Error::SignIn {
					status: status.as_u16(),
					message: http::error_message(status, response.body()),
				});
			}

			Self::parse_grant(&response, "sign-in exchange")
		})
	}

	fn refresh<'a>(
		&'a self,
		refresh_token: &'a RefreshToken,
	) -> ExchangeFuture<'a, TokenGrant, RefreshError> {
		Box::pin(async move {
			let body = RefreshBody { refresh_token: refresh_token.expose() };
			let response = self
				.post(REFRESH_PATH, &body)
				.await
				.map_err(|e| RefreshError::Exchange { message: e.to_string() })?;
			let status = response.status();

			if !status.is_success() {
				return Err(RefreshError::Rejected {
					status: status.as_u16(),
					message: http::error_message(status, response.body()),
				});
			}

			Self::parse_grant(&response, "refresh exchange")
				.map_err(|e| RefreshError::Exchange { message: e.to_string() })
		})
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInBody<'a> {
	customer_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody<'a> {
	refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default, deserialize_with = "epoch_millis")]
	expires_at: Option<OffsetDateTime>,
}

fn epoch_millis<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
	D: Deserializer<'de>,
{
	let Some(millis) = Option::<i64>::deserialize(deserializer)? else {
		return Ok(None);
	};

	OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
		.map(Some)
		.map_err(serde::de::Error::custom)
}
