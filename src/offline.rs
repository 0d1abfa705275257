//! Offline action queue: mutating actions attempted while offline, replayed in order later.
//!
//! Actions leave the queue only after a successful replay or an explicit discard. A failed
//! replay bumps that action's retry count and stops, so later actions never overtake it.

// std
use std::collections::VecDeque;
// self
use crate::{
	_prelude::*,
	auth::ActionId,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Boxed future returned by [`ReplayExecutor::replay`].
pub type ReplayFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a + Send>>;

/// Action parked while offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
	/// Queue-assigned identifier.
	pub id: ActionId,
	/// Action type tag (for example `order.create`).
	pub kind: String,
	/// Opaque action payload.
	pub payload: serde_json::Value,
	/// Enqueue instant.
	pub enqueued_at: OffsetDateTime,
	/// Failed replays so far.
	pub retries: u32,
}

/// Sends a queued action to the backend.
pub trait ReplayExecutor
where
	Self: Send + Sync,
{
	/// Replays `action`; any error leaves it queued.
	fn replay<'a>(&'a self, action: &'a QueuedAction) -> ReplayFuture<'a>;
}

/// Outcome of [`OfflineQueue::replay`].
#[derive(Debug, Default)]
pub struct ReplayReport {
	/// Actions replayed and removed.
	pub replayed: Vec<ActionId>,
	/// Action that failed and stopped the replay, with its error.
	pub failed: Option<(ActionId, Error)>,
}
impl ReplayReport {
	/// Returns `true` when nothing failed.
	pub fn is_complete(&self) -> bool {
		self.failed.is_none()
	}
}

#[derive(Debug)]
struct QueueState {
	online: bool,
	actions: VecDeque<QueuedAction>,
}

/// Process-wide queue of offline actions in insertion order.
#[derive(Debug)]
pub struct OfflineQueue {
	state: RwLock<QueueState>,
	replay_guard: AsyncMutex<()>,
}
impl OfflineQueue {
	/// Creates an empty queue with the given connectivity.
	pub fn new(online: bool) -> Self {
		Self {
			state: RwLock::new(QueueState { online, actions: VecDeque::new() }),
			replay_guard: AsyncMutex::new(()),
		}
	}

	/// Appends an action with a fresh identifier, the current timestamp, and zero retries.
	pub fn enqueue(&self, kind: impl Into<String>, payload: serde_json::Value) -> ActionId {
		let action = QueuedAction {
			id: ActionId::generate(),
			kind: kind.into(),
			payload,
			enqueued_at: OffsetDateTime::now_utc(),
			retries: 0,
		};
		let id = action.id.clone();

		self.state.write().actions.push_back(action);

		id
	}

	/// Discards the action with `id`.
	pub fn remove(&self, id: &ActionId) -> Option<QueuedAction> {
		let mut state = self.state.write();
		let index = state.actions.iter().position(|action| &action.id == id)?;

		state.actions.remove(index)
	}

	/// Discards every queued action.
	pub fn clear(&self) {
		self.state.write().actions.clear();
	}

	/// Copy of the queue in insertion order.
	pub fn snapshot(&self) -> Vec<QueuedAction> {
		self.state.read().actions.iter().cloned().collect()
	}

	/// Number of queued actions.
	pub fn len(&self) -> usize {
		self.state.read().actions.len()
	}

	/// Returns `true` when nothing is queued.
	pub fn is_empty(&self) -> bool {
		self.state.read().actions.is_empty()
	}

	/// Records connectivity changes.
	pub fn set_online(&self, online: bool) {
		self.state.write().online = online;
	}

	/// Last recorded connectivity.
	pub fn is_online(&self) -> bool {
		self.state.read().online
	}

	/// Discards actions whose retry count exceeds `max_retries`, returning them.
	pub fn discard_exhausted(&self, max_retries: u32) -> Vec<QueuedAction> {
		let mut state = self.state.write();
		let (exhausted, kept): (VecDeque<_>, VecDeque<_>) =
			state.actions.drain(..).partition(|action| action.retries > max_retries);

		state.actions = kept;

		exhausted.into()
	}

	/// Replays queued actions in order while online.
	///
	/// Successful actions are removed. The first failure increments that action's retry count
	/// and ends the replay. Concurrent calls run one after another.
	pub async fn replay(&self, executor: &dyn ReplayExecutor) -> ReplayReport {
		const KIND: FlowKind = FlowKind::OfflineReplay;

		let _guard = self.replay_guard.lock().await;
		let span = FlowSpan::new(KIND, "replay");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let report = span
			.instrument(async {
				let mut report = ReplayReport::default();

				while let Some(action) = self.next_replayable() {
					match executor.replay(&action).await {
						Ok(()) => {
							self.remove(&action.id);
							report.replayed.push(action.id);
						},
						Err(e) => {
							obs::log_warn!(action = %action.id, error = %e, "Offline replay failed.");

							self.bump_retries(&action.id);
							report.failed = Some((action.id, e));

							break;
						},
					}
				}

				report
			})
			.await;
		let outcome = if report.is_complete() { FlowOutcome::Success } else { FlowOutcome::Failure };

		obs::record_flow_outcome(KIND, outcome);

		report
	}

	fn next_replayable(&self) -> Option<QueuedAction> {
		let state = self.state.read();

		if state.online { state.actions.front().cloned() } else { None }
	}

	fn bump_retries(&self, id: &ActionId) {
		if let Some(action) = self.state.write().actions.iter_mut().find(|action| &action.id == id) {
			action.retries += 1;
		}
	}
}
impl Default for OfflineQueue {
	fn default() -> Self {
		Self::new(true)
	}
}
