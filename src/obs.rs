//! Optional observability helpers for session flows.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `backoffice_session.flow` with the `flow`
//!   and `stage` (call site) fields (request spans add `method` and `path`), plus point events for dropped payloads, reconnect scheduling,
//!   persistence failures, and forced sign-outs.
//! - Enable `metrics` to increment the `backoffice_session_flow_total` counter for every
//!   attempt/success/failure, labeled by `flow` + `outcome`, and the
//!   `backoffice_session_realtime_transition_total` counter labeled by the realtime `state` entered.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Emits a `WARN` event when the `tracing` feature is enabled.
macro_rules! log_warn {
	($($arg:tt)*) => {
		#[cfg(feature = "tracing")]
		{
			::tracing::warn!($($arg)*);
		}
	};
}
/// Emits a `DEBUG` event when the `tracing` feature is enabled.
macro_rules! log_debug {
	($($arg:tt)*) => {
		#[cfg(feature = "tracing")]
		{
			::tracing::debug!($($arg)*);
		}
	};
}
pub(crate) use log_debug;
pub(crate) use log_warn;

/// Session-layer flows observed by the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Sign-in exchange.
	SignIn,
	/// Refresh exchange driven by the Refresh Coordinator.
	Refresh,
	/// Outbound API call through the Request Pipeline.
	Request,
	/// Realtime invalidation channel lifecycle.
	Realtime,
	/// Replay of queued offline actions.
	OfflineReplay,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::SignIn => "sign_in",
			FlowKind::Refresh => "refresh",
			FlowKind::Request => "request",
			FlowKind::Realtime => "realtime",
			FlowKind::OfflineReplay => "offline_replay",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to a flow.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}

	/// Maps a flow result onto its terminal outcome.
	pub fn of<T, E>(result: &Result<T, E>) -> Self {
		match result {
			Ok(_) => FlowOutcome::Success,
			Err(_) => FlowOutcome::Failure,
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
