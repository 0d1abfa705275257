//! Environment-level configuration, read once at start-up and never reloaded.
//!
//! [`SessionConfig::from_env`] layers built-in defaults under `BACKOFFICE_*` environment
//! variables (for example `BACKOFFICE_API_BASE_URL`, `BACKOFFICE_REALTIME_URL`,
//! `BACKOFFICE_DEMO_MODE`). Programmatic construction goes through [`SessionConfig::new`] and
//! the `with_*` setters.

// std
use std::path::PathBuf;
// self
use crate::{_prelude::*, error::ConfigError, realtime::ReconnectPolicy, session::SessionStore};

const ENV_PREFIX: &str = "BACKOFFICE";

/// How the realtime invalidation channel operates for this session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RealtimeMode {
	/// Hold a long-lived connection to the endpoint.
	Socket(Url),
	/// No endpoint, demo mode on: emit invalidations on a fixed interval.
	Polling(StdDuration),
	/// No endpoint and no demo mode: no invalidations are produced.
	Disabled,
}

/// Settings consumed by the session layer.
#[derive(Clone, Debug)]
pub struct SessionConfig {
	/// Backend base address; endpoint paths are resolved against it.
	pub api_base_url: Url,
	/// Realtime endpoint; absence triggers the polling fallback when demo mode is on.
	pub realtime_url: Option<Url>,
	/// Demo/mock mode flag.
	pub demo_mode: bool,
	/// Safety margin before expiry after which an access token is no longer sent.
	pub token_skew: Duration,
	/// Reconnect budget and backoff for the realtime channel.
	pub reconnect: ReconnectPolicy,
	/// Interval between polling-fallback invalidations.
	pub poll_interval: StdDuration,
	/// Per-request timeout applied by the default transport.
	pub request_timeout: StdDuration,
	/// Sign-in entry point the UI is redirected to after an irrecoverable auth failure.
	pub sign_in_path: String,
	/// Optional file used to persist the session across restarts.
	pub session_file: Option<PathBuf>,
}
impl SessionConfig {
	/// Default interval between polling-fallback invalidations.
	pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(30);
	/// Default per-request timeout.
	pub const DEFAULT_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);
	/// Default sign-in entry point.
	pub const DEFAULT_SIGN_IN_PATH: &str = "/login";

	/// Creates a configuration with defaults for everything except the backend address.
	pub fn new(api_base_url: Url) -> Self {
		Self {
			api_base_url: with_trailing_slash(api_base_url),
			realtime_url: None,
			demo_mode: false,
			token_skew: Duration::seconds(60),
			reconnect: ReconnectPolicy::default(),
			poll_interval: Self::DEFAULT_POLL_INTERVAL,
			request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
			sign_in_path: Self::DEFAULT_SIGN_IN_PATH.into(),
			session_file: None,
		}
	}

	/// Loads the configuration from `BACKOFFICE_*` environment variables.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_environment(Self::environment())
	}

	fn environment() -> ::config::Environment {
		::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true)
	}

	pub(crate) fn from_environment(source: ::config::Environment) -> Result<Self, ConfigError> {
		let raw: RawConfig = ::config::Config::builder()
			.set_default("api_base_url", "http://localhost:8080/")?
			.set_default("demo_mode", false)?
			.set_default("token_skew_secs", 60_i64)?
			.set_default("reconnect_max_attempts", 5_i64)?
			.set_default("reconnect_base_delay_ms", 1_000_i64)?
			.set_default("poll_interval_secs", 30_i64)?
			.set_default("request_timeout_secs", 30_i64)?
			.set_default("sign_in_path", Self::DEFAULT_SIGN_IN_PATH)?
			.add_source(source)
			.build()?
			.try_deserialize()?;

		raw.validate()
	}

	/// Sets the realtime endpoint.
	pub fn with_realtime_url(mut self, url: Url) -> Self {
		self.realtime_url = Some(url);

		self
	}

	/// Toggles demo mode.
	pub fn with_demo_mode(mut self, demo_mode: bool) -> Self {
		self.demo_mode = demo_mode;

		self
	}

	/// Overrides the token safety margin, clamped to `0..=SessionStore::MAX_SKEW`.
	pub fn with_token_skew(mut self, skew: Duration) -> Self {
		self.token_skew = SessionStore::clamp_skew(skew);

		self
	}

	/// Overrides the realtime reconnect policy.
	pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
		self.reconnect = policy;

		self
	}

	/// Overrides the polling-fallback interval.
	pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
		self.poll_interval = interval;

		self
	}

	/// Overrides the sign-in entry point.
	pub fn with_sign_in_path(mut self, path: impl Into<String>) -> Self {
		self.sign_in_path = path.into();

		self
	}

	/// Persists the session to `path`.
	pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.session_file = Some(path.into());

		self
	}

	/// Resolves the realtime operating mode; socket and polling are mutually exclusive.
	pub fn realtime_mode(&self) -> RealtimeMode {
		match (&self.realtime_url, self.demo_mode) {
			(Some(url), _) => RealtimeMode::Socket(url.clone()),
			(None, true) => RealtimeMode::Polling(self.poll_interval),
			(None, false) => RealtimeMode::Disabled,
		}
	}

	/// Resolves `path` against the backend base address.
	pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
		self.api_base_url
			.join(path.trim_start_matches('/'))
			.map_err(|source| ConfigError::InvalidUrl { field: "endpoint", source })
	}
}

#[derive(Deserialize)]
struct RawConfig {
	api_base_url: String,
	realtime_url: Option<String>,
	demo_mode: bool,
	token_skew_secs: i64,
	reconnect_max_attempts: u32,
	reconnect_base_delay_ms: u64,
	poll_interval_secs: u64,
	request_timeout_secs: u64,
	sign_in_path: String,
	session_file: Option<String>,
}
impl RawConfig {
	fn validate(self) -> Result<SessionConfig, ConfigError> {
		let api_base_url = Url::parse(&self.api_base_url)
			.map_err(|source| ConfigError::InvalidUrl { field: "api_base_url", source })?;
		let realtime_url = self
			.realtime_url
			.filter(|value| !value.trim().is_empty())
			.map(|value| Url::parse(&value))
			.transpose()
			.map_err(|source| ConfigError::InvalidUrl { field: "realtime_url", source })?;

		if self.token_skew_secs < 0 {
			return Err(invalid("token_skew_secs", "must not be negative"));
		}
		if self.token_skew_secs > SessionStore::MAX_SKEW.whole_seconds() {
			return Err(invalid("token_skew_secs", "must not exceed one day"));
		}
		if self.reconnect_base_delay_ms == 0 {
			return Err(invalid("reconnect_base_delay_ms", "must be positive"));
		}
		if self.poll_interval_secs == 0 {
			return Err(invalid("poll_interval_secs", "must be positive"));
		}
		if self.request_timeout_secs == 0 {
			return Err(invalid("request_timeout_secs", "must be positive"));
		}

		let mut config = SessionConfig::new(api_base_url)
			.with_demo_mode(self.demo_mode)
			.with_token_skew(Duration::seconds(self.token_skew_secs))
			.with_reconnect_policy(ReconnectPolicy::new(
				self.reconnect_max_attempts,
				StdDuration::from_millis(self.reconnect_base_delay_ms),
			))
			.with_poll_interval(StdDuration::from_secs(self.poll_interval_secs))
			.with_sign_in_path(self.sign_in_path);

		config.realtime_url = realtime_url;
		config.request_timeout = StdDuration::from_secs(self.request_timeout_secs);
		config.session_file =
			self.session_file.filter(|value| !value.trim().is_empty()).map(PathBuf::from);

		Ok(config)
	}
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
	ConfigError::InvalidSetting { field, reason: reason.into() }
}

fn with_trailing_slash(mut url: Url) -> Url {
	if !url.path().ends_with('/') {
		let path = format!("{}/", url.path());

		url.set_path(&path);
	}

	url
}
