//! Request Pipeline: every backend call passes through [`ApiClient::send`].
//!
//! Before sending, the pipeline attaches the bearer token (when the Token Store yields a valid
//! one) and, for create/update/partial-update methods, an idempotency key unless the caller set
//! one. A `401` on the first attempt hands control to the Refresh Coordinator and the call is
//! resent exactly once with the new token and the same idempotency key. A failed refresh, or a
//! `401` on the resent call, clears the session and publishes [`SessionEvent::SignInRequired`].

// crates.io
use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri,
	header::{AUTHORIZATION, CONTENT_TYPE},
};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
// self
use crate::{
	_prelude::*,
	auth::{AccessToken, CustomerId, Session},
	config::SessionConfig,
	error::ConfigError,
	exchange::{HttpTokenExchange, SignInRequest, TokenExchange},
	http::{self, HttpRequest, HttpResponse, HttpTransport},
	idempotency::{IDEMPOTENCY_HEADER, IdempotencyKey},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	refresh::{RefreshCoordinator, RefreshMetrics},
	session::SessionStore,
};
#[cfg(feature = "reqwest")]
use crate::{
	http::ReqwestTransport,
	store::{FilePersistence, MemoryPersistence, SessionPersistence},
};

const EVENT_CAPACITY: usize = 16;

/// [`ApiClient`] specialized for the default reqwest transport.
#[cfg(feature = "reqwest")]
pub type ReqwestApiClient = ApiClient<ReqwestTransport>;

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignOutReason {
	/// The user signed out explicitly.
	UserRequested,
	/// The refresh exchange failed, or no refresh token was available.
	RefreshFailed,
	/// The backend still rejected a call after the one-shot refresh-and-retry.
	Unauthorized,
}
impl SignOutReason {
	/// Returns a stable label for logs.
	pub const fn as_str(self) -> &'static str {
		match self {
			SignOutReason::UserRequested => "user_requested",
			SignOutReason::RefreshFailed => "refresh_failed",
			SignOutReason::Unauthorized => "unauthorized",
		}
	}
}

/// Session lifecycle notifications for the UI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
	/// A sign-in exchange succeeded.
	SignedIn {
		/// Customer now signed in.
		subject: CustomerId,
	},
	/// The user signed out explicitly.
	SignedOut {
		/// Always [`SignOutReason::UserRequested`] today.
		reason: SignOutReason,
	},
	/// The session was cleared after an irrecoverable auth failure; navigate to sign-in.
	SignInRequired {
		/// What ended the session.
		reason: SignOutReason,
		/// Sign-in entry point to navigate to.
		redirect_to: String,
	},
}

/// Outbound call description carrying an immutable attempt count.
///
/// The refresh-and-retry guard is a value check on [`ApiRequest::attempt`]; retries are new
/// values produced by [`ApiRequest::retried`], never in-place mutations.
#[derive(Clone, Debug)]
pub struct ApiRequest {
	method: Method,
	path: String,
	headers: HeaderMap,
	body: Option<Vec<u8>>,
	idempotency_key: Option<IdempotencyKey>,
	attempt: u8,
}
impl ApiRequest {
	/// Creates a request for `path`, resolved against the configured base address.
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			headers: HeaderMap::new(),
			body: None,
			idempotency_key: None,
			attempt: 0,
		}
	}

	/// `GET path`.
	pub fn get(path: impl Into<String>) -> Self {
		Self::new(Method::GET, path)
	}

	/// `POST path`.
	pub fn post(path: impl Into<String>) -> Self {
		Self::new(Method::POST, path)
	}

	/// `PUT path`.
	pub fn put(path: impl Into<String>) -> Self {
		Self::new(Method::PUT, path)
	}

	/// `PATCH path`.
	pub fn patch(path: impl Into<String>) -> Self {
		Self::new(Method::PATCH, path)
	}

	/// `DELETE path`.
	pub fn delete(path: impl Into<String>) -> Self {
		Self::new(Method::DELETE, path)
	}

	/// Serializes `body` as the JSON payload.
	pub fn json(mut self, body: &impl Serialize) -> Result<Self, ConfigError> {
		self.body = Some(serde_json::to_vec(body).map_err(ConfigError::Body)?);

		Ok(self)
	}

	/// Adds a header. An `Idempotency-Key` header (any casing) counts as caller-supplied.
	pub fn header(mut self, name: &str, value: &str) -> Result<Self, ConfigError> {
		let name = HeaderName::from_bytes(name.as_bytes()).map_err(::http::Error::from)?;
		let value = HeaderValue::from_str(value).map_err(::http::Error::from)?;

		self.headers.append(name, value);

		Ok(self)
	}

	/// Supplies the idempotency key instead of letting the pipeline generate one.
	pub fn idempotency_key(mut self, key: IdempotencyKey) -> Self {
		self.idempotency_key = Some(key);

		self
	}

	/// HTTP method.
	pub fn method(&self) -> &Method {
		&self.method
	}

	/// Path relative to the base address.
	pub fn path(&self) -> &str {
		&self.path
	}

	/// Zero for the original send, one for the refresh-triggered resend.
	pub fn attempt(&self) -> u8 {
		self.attempt
	}

	/// Returns `true` while the one-shot retry guard is unconsumed.
	pub fn can_retry(&self) -> bool {
		self.attempt == 0
	}

	/// Returns a copy of this call marked as the refresh-triggered resend.
	pub fn retried(&self) -> Self {
		Self { attempt: self.attempt.saturating_add(1), ..self.clone() }
	}

	/// Returns `true` for create/update/partial-update methods.
	pub fn is_mutating(&self) -> bool {
		matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
	}

	/// Key that will be sent with this call, if any.
	pub fn current_idempotency_key(&self) -> Option<&str> {
		self.idempotency_key
			.as_ref()
			.map(IdempotencyKey::as_str)
			.or_else(|| self.headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok()))
	}

	// Fixed before the first send so the resend carries the same key.
	fn with_idempotency(mut self) -> Self {
		if self.is_mutating()
			&& self.idempotency_key.is_none()
			&& !self.headers.contains_key(IDEMPOTENCY_HEADER)
		{
			self.idempotency_key = Some(IdempotencyKey::generate());
		}

		self
	}

	fn to_http(&self, url: &Url, token: Option<&AccessToken>) -> Result<HttpRequest, ConfigError> {
		let mut request = HttpRequest::new(self.body.clone().unwrap_or_default());

		*request.method_mut() = self.method.clone();
		*request.uri_mut() = url.as_str().parse::<Uri>().map_err(::http::Error::from)?;
		*request.headers_mut() = self.headers.clone();

		let headers = request.headers_mut();

		if self.body.is_some() && !headers.contains_key(CONTENT_TYPE) {
			headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		}
		if let Some(token) = token {
			headers.insert(
				AUTHORIZATION,
				HeaderValue::from_str(&token.bearer()).map_err(::http::Error::from)?,
			);
		}
		if let Some(key) = &self.idempotency_key {
			headers.insert(
				HeaderName::from_static(IDEMPOTENCY_HEADER),
				HeaderValue::from_str(key.as_str()).map_err(::http::Error::from)?,
			);
		}

		Ok(request)
	}
}

/// Successful backend response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
	status: StatusCode,
	headers: HeaderMap,
	body: Vec<u8>,
}
impl ApiResponse {
	fn from_http(response: HttpResponse) -> Self {
		let (parts, body) = response.into_parts();

		Self { status: parts.status, headers: parts.headers, body }
	}

	/// Response status.
	pub fn status(&self) -> StatusCode {
		self.status
	}

	/// Response headers.
	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Raw response body.
	pub fn body(&self) -> &[u8] {
		&self.body
	}

	/// Decodes the body as JSON, reporting the failing path on mismatch.
	pub fn json<T>(&self) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let mut deserializer = serde_json::Deserializer::from_slice(&self.body);

		serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| Error::Decode { context: "api response", source })
	}
}

/// Explicitly constructed session context: Token Store, Refresh Coordinator, and transport.
pub struct ApiClient<C>
where
	C: ?Sized + HttpTransport,
{
	config: Arc<SessionConfig>,
	session: Arc<SessionStore>,
	transport: Arc<C>,
	exchange: Arc<dyn TokenExchange>,
	refresher: Arc<RefreshCoordinator>,
	events: broadcast::Sender<SessionEvent>,
}
impl<C> ApiClient<C>
where
	C: ?Sized + HttpTransport,
{
	/// Wires a client from its collaborators; exchanges use the same transport.
	pub fn with_transport(config: SessionConfig, session: Arc<SessionStore>, transport: Arc<C>) -> Self {
		let config = Arc::new(config);
		let exchange: Arc<dyn TokenExchange> =
			Arc::new(HttpTokenExchange::new(config.clone(), transport.clone()));
		let refresher = Arc::new(RefreshCoordinator::new(session.clone(), exchange.clone()));
		let (events, _) = broadcast::channel(EVENT_CAPACITY);

		Self { config, session, transport, exchange, refresher, events }
	}

	/// Replaces the sign-in/refresh exchange (and rebuilds the coordinator around it).
	pub fn with_exchange(mut self, exchange: Arc<dyn TokenExchange>) -> Self {
		self.refresher = Arc::new(RefreshCoordinator::new(self.session.clone(), exchange.clone()));
		self.exchange = exchange;

		self
	}

	/// Configuration the client was built with.
	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	/// Shared Token Store.
	pub fn session(&self) -> &Arc<SessionStore> {
		&self.session
	}

	/// Shared Refresh Coordinator.
	pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
		&self.refresher
	}

	/// Refresh counters.
	pub fn refresh_metrics(&self) -> &RefreshMetrics {
		self.refresher.metrics()
	}

	/// Subscribes to session lifecycle events.
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	/// Signs in and replaces the stored session.
	pub async fn sign_in(&self, request: SignInRequest) -> Result<Session> {
		const KIND: FlowKind = FlowKind::SignIn;

		let span = FlowSpan::new(KIND, "sign_in");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async {
				let grant = self.exchange.sign_in(&request).await?;
				let session = Session {
					access_token: grant.access_token,
					refresh_token: grant.refresh_token,
					subject: Some(request.customer_id.clone()),
					issued_at: OffsetDateTime::now_utc(),
					expires_at: grant.expires_at,
				};

				self.session.replace(session.clone()).await;
				self.publish(SessionEvent::SignedIn { subject: request.customer_id.clone() });

				Ok(session)
			})
			.await;

		obs::record_flow_outcome(KIND, FlowOutcome::of(&result));

		result
	}

	/// Clears the session at the user's request.
	pub async fn sign_out(&self) {
		self.session.clear().await;
		self.publish(SessionEvent::SignedOut { reason: SignOutReason::UserRequested });
	}

	/// Sends `request` through the pipeline.
	pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
		const KIND: FlowKind = FlowKind::Request;

		let span = FlowSpan::request(request.method.as_str(), &request.path);

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.dispatch(request.with_idempotency())).await;

		obs::record_flow_outcome(KIND, FlowOutcome::of(&result));

		result
	}

	/// `GET path`.
	pub async fn get(&self, path: &str) -> Result<ApiResponse> {
		self.send(ApiRequest::get(path)).await
	}

	/// `DELETE path`.
	pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
		self.send(ApiRequest::delete(path)).await
	}

	/// `POST path` with a JSON body.
	pub async fn post(&self, path: &str, body: &impl Serialize) -> Result<ApiResponse> {
		self.send(ApiRequest::post(path).json(body)?).await
	}

	/// `PUT path` with a JSON body.
	pub async fn put(&self, path: &str, body: &impl Serialize) -> Result<ApiResponse> {
		self.send(ApiRequest::put(path).json(body)?).await
	}

	/// `PATCH path` with a JSON body.
	pub async fn patch(&self, path: &str, body: &impl Serialize) -> Result<ApiResponse> {
		self.send(ApiRequest::patch(path).json(body)?).await
	}

	async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse> {
		let token = self.session.valid_access_token();
		let response = self.execute(&request, token.as_ref()).await?;

		if response.status() != StatusCode::UNAUTHORIZED {
			return Self::into_result(response);
		}
		if !request.can_retry() {
			return Err(self.end_session(SignOutReason::Unauthorized, Error::Unauthorized).await);
		}

		let fresh = match self.refresher.refresh_after(token.as_ref()).await {
			Ok(fresh) => fresh,
			Err(err) => {
				return Err(self.end_session(SignOutReason::RefreshFailed, err.into()).await);
			},
		};
		let retry = request.retried();
		let response = self.execute(&retry, Some(&fresh)).await?;

		if response.status() == StatusCode::UNAUTHORIZED {
			return Err(self.end_session(SignOutReason::Unauthorized, Error::Unauthorized).await);
		}

		Self::into_result(response)
	}

	async fn execute(
		&self,
		request: &ApiRequest,
		token: Option<&AccessToken>,
	) -> Result<HttpResponse> {
		let url = self.config.endpoint(&request.path)?;
		let http_request = request.to_http(&url, token)?;

		Ok(self.transport.execute(http_request).await?)
	}

	fn into_result(response: HttpResponse) -> Result<ApiResponse> {
		let status = response.status();

		if status.is_success() {
			Ok(ApiResponse::from_http(response))
		} else {
			Err(Error::Api {
				status: status.as_u16(),
				message: http::error_message(status, response.body()),
			})
		}
	}

	// Callers sharing one failed refresh all land here; only the one that removed the
	// session announces it.
	async fn end_session(&self, reason: SignOutReason, err: Error) -> Error {
		if self.session.clear().await {
			obs::log_warn!(reason = reason.as_str(), error = %err, "Cleared session after auth failure.");

			self.publish(SessionEvent::SignInRequired {
				reason,
				redirect_to: self.config.sign_in_path.clone(),
			});
		}

		err
	}

	fn publish(&self, event: SessionEvent) {
		// No subscribers is fine.
		let _ = self.events.send(event);
	}
}
#[cfg(feature = "reqwest")]
impl ApiClient<ReqwestTransport> {
	/// Builds a reqwest-backed client, restoring any session persisted at
	/// [`SessionConfig::session_file`].
	pub async fn from_config(config: SessionConfig) -> Result<Self> {
		let persistence: Arc<dyn SessionPersistence> = match &config.session_file {
			Some(path) => Arc::new(FilePersistence::open(path)?),
			None => Arc::new(MemoryPersistence::default()),
		};
		let session = Arc::new(SessionStore::restore(persistence, config.token_skew).await);
		let transport = Arc::new(ReqwestTransport::from_config(&config)?);

		Ok(Self::with_transport(config, session, transport))
	}
}
impl<C> Clone for ApiClient<C>
where
	C: ?Sized + HttpTransport,
{
	fn clone(&self) -> Self {
		Self {
			config: self.config.clone(),
			session: self.session.clone(),
			transport: self.transport.clone(),
			exchange: self.exchange.clone(),
			refresher: self.refresher.clone(),
			events: self.events.clone(),
		}
	}
}
impl<C> Debug for ApiClient<C>
where
	C: ?Sized + HttpTransport,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ApiClient")
			.field("api_base_url", &self.config.api_base_url.as_str())
			.field("session", &self.session)
			.field("refresher", &self.refresher)
			.finish_non_exhaustive()
	}
}
