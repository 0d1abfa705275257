//! Connection state machine for the realtime channel.
//!
//! The machine is pure: the driver feeds it [`ConnectionEvent`]s and performs the returned
//! [`ConnectionAction`]. All reconnect bookkeeping (attempt counter, backoff, the stop condition)
//! lives here so it can be asserted without sockets or timers.

// self
use crate::_prelude::*;

/// Lifecycle state of the realtime connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
	/// No connection; a retry may be pending.
	Disconnected,
	/// A connection attempt is in progress.
	Connecting,
	/// The connection is open and delivering messages.
	Connected,
	/// The reconnect budget is exhausted; only an explicit reset resumes.
	Stopped,
	/// The owner tore the channel down; terminal.
	TornDown,
}
impl ConnectionState {
	/// Returns a stable label for logs.
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Stopped => "stopped",
			ConnectionState::TornDown => "torn_down",
		}
	}
}
impl Display for ConnectionState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Inputs to [`ConnectionMachine::handle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
	/// The owner started the channel.
	Start,
	/// The connection opened.
	Opened,
	/// The connection closed, errored, or failed to open.
	Closed,
	/// The backoff delay elapsed.
	RetryElapsed,
	/// The owner re-armed a stopped channel.
	Reset,
	/// The owner tore the channel down.
	TearDown,
}

/// Work the driver must perform after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionAction {
	/// Open a connection now.
	Connect,
	/// Wait this long, then report [`ConnectionEvent::RetryElapsed`].
	Wait(StdDuration),
	/// Nothing to do until the next external event.
	Idle,
}

/// Reconnect budget and exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
	/// Retries allowed before the channel stops.
	pub max_attempts: u32,
	/// Delay before the first retry; each further retry doubles it.
	pub base_delay: StdDuration,
}
impl ReconnectPolicy {
	/// Creates a policy.
	pub const fn new(max_attempts: u32, base_delay: StdDuration) -> Self {
		Self { max_attempts, base_delay }
	}

	/// Delay before retry number `attempt` (zero-based): `base_delay * 2^attempt`.
	pub fn delay_for(&self, attempt: u32) -> StdDuration {
		let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);

		self.base_delay.saturating_mul(factor)
	}
}
impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self::new(5, StdDuration::from_secs(1))
	}
}

/// Single-field state machine with its reconnect counter.
#[derive(Clone, Debug)]
pub struct ConnectionMachine {
	state: ConnectionState,
	attempts: u32,
	policy: ReconnectPolicy,
}
impl ConnectionMachine {
	/// Creates a machine in [`ConnectionState::Disconnected`].
	pub fn new(policy: ReconnectPolicy) -> Self {
		Self { state: ConnectionState::Disconnected, attempts: 0, policy }
	}

	/// Current state.
	pub fn state(&self) -> ConnectionState {
		self.state
	}

	/// Retries consumed since the last successful open.
	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	/// Policy the machine enforces.
	pub fn policy(&self) -> &ReconnectPolicy {
		&self.policy
	}

	/// Applies `event` and returns the follow-up work. Events that do not apply to the
	/// current state are ignored.
	pub fn handle(&mut self, event: ConnectionEvent) -> ConnectionAction {
		use ConnectionEvent as E;
		use ConnectionState as S;

		match (self.state, event) {
			(S::TornDown, _) => ConnectionAction::Idle,
			(_, E::TearDown) => {
				self.state = S::TornDown;

				ConnectionAction::Idle
			},
			(S::Disconnected, E::Start | E::RetryElapsed) => {
				self.state = S::Connecting;

				ConnectionAction::Connect
			},
			(S::Connecting, E::Opened) => {
				self.state = S::Connected;
				self.attempts = 0;

				ConnectionAction::Idle
			},
			(S::Connecting | S::Connected, E::Closed) => self.schedule_retry(),
			(S::Stopped, E::Reset) => {
				self.attempts = 0;
				self.state = S::Connecting;

				ConnectionAction::Connect
			},
			_ => ConnectionAction::Idle,
		}
	}

	fn schedule_retry(&mut self) -> ConnectionAction {
		if self.attempts >= self.policy.max_attempts {
			self.state = ConnectionState::Stopped;

			return ConnectionAction::Idle;
		}

		let delay = self.policy.delay_for(self.attempts);

		self.attempts += 1;
		self.state = ConnectionState::Disconnected;

		ConnectionAction::Wait(delay)
	}
}
