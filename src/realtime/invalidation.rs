//! Invalidation bus: broadcasts stale cache groups and remembers them until acknowledged.

// crates.io
use tokio::sync::broadcast;
// self
use crate::{
	_prelude::*,
	realtime::{CacheGroup, RealtimeEvent},
};

/// Where an invalidation came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationSource {
	/// A realtime message with this `type` discriminator.
	Realtime {
		/// Event discriminator.
		kind: String,
	},
	/// The fixed-interval polling fallback.
	Polling,
}

/// Signal telling the data layer that cached data for `groups` must be refetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invalidation {
	/// Stale groups.
	pub groups: Vec<CacheGroup>,
	/// Origin of the signal.
	pub source: InvalidationSource,
}
impl Invalidation {
	/// Invalidation emitted by each polling tick: every group.
	pub fn polling() -> Self {
		Self { groups: CacheGroup::ALL.to_vec(), source: InvalidationSource::Polling }
	}

	/// Invalidation for a recognized realtime event, or `None` when it invalidates nothing.
	pub fn from_event(event: &RealtimeEvent) -> Option<Self> {
		let groups = event.invalidates();

		(!groups.is_empty()).then(|| Self {
			groups: groups.to_vec(),
			source: InvalidationSource::Realtime { kind: event.kind.clone() },
		})
	}
}

/// Fan-out point between the realtime channel and the data-fetching layer.
#[derive(Debug)]
pub struct InvalidationBus {
	sender: broadcast::Sender<Invalidation>,
	stale: Mutex<HashSet<CacheGroup>>,
}
impl InvalidationBus {
	const DEFAULT_CAPACITY: usize = 64;

	/// Creates a bus buffering up to `capacity` signals per lagging subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));

		Self { sender, stale: Mutex::new(HashSet::new()) }
	}

	/// Subscribes to future invalidations.
	pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
		self.sender.subscribe()
	}

	/// Marks the groups stale and broadcasts the signal.
	pub fn publish(&self, invalidation: Invalidation) {
		self.stale.lock().extend(invalidation.groups.iter().copied());

		// Stale tracking still records the groups when nobody is subscribed.
		let _ = self.sender.send(invalidation);
	}

	/// Returns `true` if `group` was invalidated and not yet acknowledged.
	pub fn is_stale(&self, group: CacheGroup) -> bool {
		self.stale.lock().contains(&group)
	}

	/// Clears the stale mark after the data layer refetched; returns whether it was set.
	pub fn acknowledge(&self, group: CacheGroup) -> bool {
		self.stale.lock().remove(&group)
	}

	/// Stale groups in stable order.
	pub fn stale_groups(&self) -> Vec<CacheGroup> {
		let mut groups: Vec<_> = self.stale.lock().iter().copied().collect();

		groups.sort();

		groups
	}
}
impl Default for InvalidationBus {
	fn default() -> Self {
		Self::new(Self::DEFAULT_CAPACITY)
	}
}
