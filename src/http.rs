//! Transport seam for backend calls.
//!
//! The pipeline and exchanges depend only on [`HttpTransport`], which executes a fully built
//! [`HttpRequest`] and returns the buffered [`HttpResponse`]. Interception (auth headers,
//! idempotency keys, refresh-and-retry) lives above this layer, so custom transports (test
//! doubles, recording proxies) only move bytes.

// std
#[cfg(feature = "reqwest")] use std::ops::Deref;
// self
use crate::{_prelude::*, error::TransportError};
#[cfg(feature = "reqwest")] use crate::{config::SessionConfig, error::ConfigError};

/// Outbound request as handed to a transport.
pub type HttpRequest = ::http::Request<Vec<u8>>;
/// Buffered response returned by a transport.
pub type HttpResponse = ::http::Response<Vec<u8>>;
/// Boxed future returned by [`HttpTransport::execute`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + 'a + Send>>;

/// Abstraction over HTTP stacks capable of executing backend calls.
///
/// Implementations must be `Send + Sync + 'static` so one transport can be shared by the
/// pipeline and the token exchanges behind an `Arc`. Non-success statuses are not errors at
/// this layer; only failures that prevent a response (DNS, TCP, TLS, IO) are.
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Sends `request` and buffers the full response body.
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_>;
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport(pub ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	/// Builds a client honouring the configured request timeout.
	pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder().timeout(config.request_timeout).build()?;

		Ok(Self(client))
	}
}
#[cfg(feature = "reqwest")]
impl AsRef<ReqwestClient> for ReqwestTransport {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl Deref for ReqwestTransport {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl HttpTransport for ReqwestTransport {
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		let client = self.0.clone();

		Box::pin(async move {
			let request = reqwest::Request::try_from(request)?;
			let response = client.execute(request).await?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let mut buffered = HttpResponse::new(response.bytes().await?.to_vec());

			*buffered.status_mut() = status;
			*buffered.headers_mut() = headers;

			Ok(buffered)
		})
	}
}

#[derive(Deserialize)]
struct ErrorBody {
	message: String,
}

/// Extracts the backend's `{"message": "..."}` error text, falling back to the status reason.
pub(crate) fn error_message(status: ::http::StatusCode, body: &[u8]) -> String {
	serde_json::from_slice::<ErrorBody>(body)
		.ok()
		.map(|body| body.message)
		.filter(|message| !message.trim().is_empty())
		.unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_owned())
}
