//! Crate-level error types shared across the Token Store, pipeline, and exchanges.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Token refresh failed; the session cannot be recovered without signing in again.
	#[error(transparent)]
	Refresh(#[from] RefreshError),

	/// Backend responded with JSON that does not match the expected shape.
	#[error("Backend returned malformed JSON for {context}.")]
	Decode {
		/// Exchange or endpoint that produced the payload.
		context: &'static str,
		/// Structured parsing failure, including the offending path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// Backend rejected the call as unauthorized after the one-shot retry was consumed.
	#[error("Request is unauthorized.")]
	Unauthorized,
	/// Backend rejected the sign-in exchange.
	#[error("Sign-in was rejected: {message}.")]
	SignIn {
		/// HTTP status code returned by the backend.
		status: u16,
		/// Backend-supplied message, or a generic fallback.
		message: String,
	},
	/// Backend returned a non-success status other than 401.
	#[error("Backend returned {status}: {message}.")]
	Api {
		/// HTTP status code returned by the backend.
		status: u16,
		/// Backend-supplied message, or a generic fallback.
		message: String,
	},
}
impl Error {
	/// Returns `true` when the error ends the current session.
	pub fn is_session_fatal(&self) -> bool {
		matches!(self, Self::Refresh(_) | Self::Unauthorized)
	}
}

/// Configuration and validation failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] ::http::Error),
	/// A configured or derived URL is invalid.
	#[error("The {field} URL is invalid.")]
	InvalidUrl {
		/// Name of the setting that carried the URL.
		field: &'static str,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// A setting holds a value outside its supported range.
	#[error("Setting `{field}` is invalid: {reason}.")]
	InvalidSetting {
		/// Name of the offending setting.
		field: &'static str,
		/// Why the value was rejected.
		reason: String,
	},
	/// Environment-level configuration could not be loaded.
	#[error("Configuration could not be loaded.")]
	Load(#[from] ::config::ConfigError),
	/// Request body could not be serialized.
	#[error("Request body could not be serialized.")]
	Body(#[source] serde_json::Error),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Refresh failures handed to every caller coalesced onto the same refresh.
///
/// The type is `Clone` so a single outcome can fan out to all waiters.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum RefreshError {
	/// No refresh token is stored, so the session cannot be extended.
	#[error("Session has no refresh token.")]
	MissingRefreshToken,
	/// The session was cleared while the refresh was in flight.
	#[error("Session ended while the refresh was in flight.")]
	SessionEnded,
	/// Backend rejected the refresh token.
	#[error("Refresh token was rejected ({status}): {message}.")]
	Rejected {
		/// HTTP status code returned by the refresh endpoint.
		status: u16,
		/// Backend-supplied message, or a generic fallback.
		message: String,
	},
	/// Refresh exchange failed before the backend produced a verdict.
	#[error("Refresh exchange failed: {message}.")]
	Exchange {
		/// Summary of the underlying failure.
		message: String,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the backend.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the backend.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn refresh_errors_are_session_fatal() {
		assert!(Error::from(RefreshError::MissingRefreshToken).is_session_fatal());
		assert!(Error::Unauthorized.is_session_fatal());
		assert!(!Error::Api { status: 500, message: "boom".into() }.is_session_fatal());
	}

	#[test]
	fn refresh_error_display_carries_backend_message() {
		let err = RefreshError::Rejected { status: 400, message: "Refresh token required".into() };

		assert_eq!(err.to_string(), "Refresh token was rejected (400): Refresh token required.");
	}
}
