//! Driver task and owner handle for the realtime invalidation channel.

// crates.io
use tokio::{
	sync::{Notify, watch},
	task::JoinHandle,
	time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	config::{RealtimeMode, SessionConfig},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	realtime::{
		ConnectionAction, ConnectionEvent, ConnectionMachine, ConnectionState, Invalidation,
		InvalidationBus, RealtimeEvent, RealtimeTransport, ReconnectPolicy,
	},
};

/// Observable channel status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelStatus {
	/// Connection state.
	pub state: ConnectionState,
	/// Retries consumed since the last successful open.
	pub attempts: u32,
}
impl ChannelStatus {
	fn of(machine: &ConnectionMachine) -> Self {
		Self { state: machine.state(), attempts: machine.attempts() }
	}
}

/// Starts realtime channels.
#[derive(Clone)]
pub struct RealtimeChannel {
	mode: RealtimeMode,
	policy: ReconnectPolicy,
	transport: Arc<dyn RealtimeTransport>,
	bus: Arc<InvalidationBus>,
}
impl RealtimeChannel {
	/// Creates a channel for `mode` publishing into `bus`.
	pub fn new(
		mode: RealtimeMode,
		policy: ReconnectPolicy,
		transport: Arc<dyn RealtimeTransport>,
		bus: Arc<InvalidationBus>,
	) -> Self {
		Self { mode, policy, transport, bus }
	}

	/// Creates a channel with the mode and reconnect policy from `config`.
	pub fn from_config(
		config: &SessionConfig,
		transport: Arc<dyn RealtimeTransport>,
		bus: Arc<InvalidationBus>,
	) -> Self {
		Self::new(config.realtime_mode(), config.reconnect, transport, bus)
	}

	/// Spawns the driver on the current tokio runtime.
	///
	/// Socket mode connects immediately, polling mode emits every interval, disabled mode
	/// spawns nothing. Dropping the handle cancels the driver; [`RealtimeHandle::teardown`]
	/// additionally waits for it to finish.
	pub fn spawn(self) -> RealtimeHandle {
		let machine = ConnectionMachine::new(self.policy);
		let status = Arc::new(watch::Sender::new(ChannelStatus::of(&machine)));
		let cancel = CancellationToken::new();
		let reset = Arc::new(Notify::new());
		let task = match self.mode.clone() {
			RealtimeMode::Socket(url) => {
				let driver = SocketDriver {
					url,
					machine,
					transport: self.transport,
					bus: self.bus,
					status: status.clone(),
					cancel: cancel.clone(),
					reset: reset.clone(),
				};
				let span = FlowSpan::new(FlowKind::Realtime, "socket");

				Some(tokio::spawn(span.instrument(driver.run())))
			},
			RealtimeMode::Polling(interval) => {
				let span = FlowSpan::new(FlowKind::Realtime, "polling");

				Some(tokio::spawn(span.instrument(poll(interval, self.bus, cancel.clone()))))
			},
			RealtimeMode::Disabled => None,
		};

		RealtimeHandle { mode: self.mode, status, cancel, reset, task: Mutex::new(task) }
	}
}
impl Debug for RealtimeChannel {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RealtimeChannel")
			.field("mode", &self.mode)
			.field("policy", &self.policy)
			.finish_non_exhaustive()
	}
}

/// Owner handle of a running channel.
#[derive(Debug)]
pub struct RealtimeHandle {
	mode: RealtimeMode,
	status: Arc<watch::Sender<ChannelStatus>>,
	cancel: CancellationToken,
	reset: Arc<Notify>,
	task: Mutex<Option<JoinHandle<()>>>,
}
impl RealtimeHandle {
	/// Mode the channel runs in.
	pub fn mode(&self) -> &RealtimeMode {
		&self.mode
	}

	/// Current status.
	pub fn status(&self) -> ChannelStatus {
		*self.status.borrow()
	}

	/// Current connection state.
	pub fn state(&self) -> ConnectionState {
		self.status().state
	}

	/// Subscribes to status changes.
	pub fn watch(&self) -> watch::Receiver<ChannelStatus> {
		self.status.subscribe()
	}

	/// Re-arms a stopped channel with a fresh retry budget. Returns `false` unless stopped.
	pub fn reset(&self) -> bool {
		if self.state() != ConnectionState::Stopped {
			return false;
		}

		self.reset.notify_one();

		true
	}

	/// Cancels pending timers, closes any open connection, and waits for the driver to exit.
	///
	/// Idempotent; no state transition happens after the first call returns.
	pub async fn teardown(&self) {
		self.cancel.cancel();

		let task = self.task.lock().take();

		let joined = match task {
			Some(task) => task.await,
			None => Ok(()),
		};

		if let Err(e) = joined {
			obs::log_warn!(error = %e, "Realtime driver ended abnormally.");
		}

		self.status.send_modify(|status| status.state = ConnectionState::TornDown);
	}
}
impl Drop for RealtimeHandle {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

struct SocketDriver {
	url: Url,
	machine: ConnectionMachine,
	transport: Arc<dyn RealtimeTransport>,
	bus: Arc<InvalidationBus>,
	status: Arc<watch::Sender<ChannelStatus>>,
	cancel: CancellationToken,
	reset: Arc<Notify>,
}
impl SocketDriver {
	async fn run(mut self) {
		let mut action = self.apply(ConnectionEvent::Start);

		loop {
			let next = match action {
				ConnectionAction::Connect => self.connect_and_listen().await,
				ConnectionAction::Wait(delay) => self.back_off(delay).await,
				ConnectionAction::Idle => self.wait_for_reset().await,
			};
			let Some(event) = next else {
				break;
			};

			action = self.apply(event);
		}

		self.apply(ConnectionEvent::TearDown);
	}

	// `None` means the channel was cancelled.
	async fn connect_and_listen(&mut self) -> Option<ConnectionEvent> {
		obs::record_flow_outcome(FlowKind::Realtime, FlowOutcome::Attempt);

		let connected = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => return None,
			connected = self.transport.connect(&self.url) => connected,
		};
		let mut connection = match connected {
			Ok(connection) => connection,
			Err(e) => {
				obs::log_debug!(error = %e, "Realtime connection attempt failed.");
				obs::record_flow_outcome(FlowKind::Realtime, FlowOutcome::Failure);

				return Some(ConnectionEvent::Closed);
			},
		};

		obs::record_flow_outcome(FlowKind::Realtime, FlowOutcome::Success);
		self.apply(ConnectionEvent::Opened);

		loop {
			tokio::select! {
				biased;
				_ = self.cancel.cancelled() => {
					connection.close().await;

					return None;
				},
				message = connection.next_message() => match message {
					Some(Ok(raw)) => self.dispatch(&raw),
					Some(Err(e)) => {
						obs::log_debug!(error = %e, "Realtime connection failed.");

						break;
					},
					None => break,
				},
			}
		}

		connection.close().await;

		Some(ConnectionEvent::Closed)
	}

	async fn back_off(&self, delay: StdDuration) -> Option<ConnectionEvent> {
		obs::log_debug!(
			delay_ms = delay.as_millis() as u64,
			attempt = self.machine.attempts(),
			"Scheduling realtime reconnect."
		);

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => None,
			_ = time::sleep(delay) => Some(ConnectionEvent::RetryElapsed),
		}
	}

	async fn wait_for_reset(&self) -> Option<ConnectionEvent> {
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => None,
			_ = self.reset.notified() => Some(ConnectionEvent::Reset),
		}
	}

	fn apply(&mut self, event: ConnectionEvent) -> ConnectionAction {
		let before = self.machine.state();
		let action = self.machine.handle(event);

		if self.machine.state() != before {
			obs::record_connection_state(self.machine.state());
		}

		self.status.send_replace(ChannelStatus::of(&self.machine));

		action
	}

	fn dispatch(&self, raw: &str) {
		match RealtimeEvent::parse(raw) {
			Ok(event) => match Invalidation::from_event(&event) {
				Some(invalidation) => self.bus.publish(invalidation),
				None => {
					obs::log_debug!(kind = %event.kind, "Ignoring unrecognized realtime event.");
				},
			},
			Err(e) => {
				obs::log_warn!(error = %e, "Dropping malformed realtime message.");
			},
		}
	}
}

async fn poll(interval: StdDuration, bus: Arc<InvalidationBus>, cancel: CancellationToken) {
	let mut ticker = time::interval_at(Instant::now() + interval, interval);

	ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			_ = ticker.tick() => bus.publish(Invalidation::polling()),
		}
	}
}
