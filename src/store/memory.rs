//! In-memory [`SessionPersistence`] backend for tests and demo mode.

// self
use crate::{
	_prelude::*,
	store::{SessionPersistence, StoreError, StoreFuture},
};

type EntryMap = Arc<RwLock<HashMap<String, String>>>;

/// Thread-safe persistence backend that keeps entries in-process.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersistence(EntryMap);
impl MemoryPersistence {
	/// Returns a copy of the value under `key` without going through the async contract.
	pub fn peek(&self, key: &str) -> Option<String> {
		self.0.read().get(key).cloned()
	}

	/// Returns the number of stored entries.
	pub fn len(&self) -> usize {
		self.0.read().len()
	}

	/// Returns `true` when nothing is stored.
	pub fn is_empty(&self) -> bool {
		self.0.read().is_empty()
	}

	fn set_now(map: EntryMap, key: String, value: String) -> Result<(), StoreError> {
		map.write().insert(key, value);

		Ok(())
	}
}
impl SessionPersistence for MemoryPersistence {
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
		let value = self.peek(key);

		Box::pin(async move { Ok(value) })
	}

	fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, ()> {
		let map = self.0.clone();
		let key = key.to_owned();

		Box::pin(async move { Self::set_now(map, key, value) })
	}

	fn clear<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		let map = self.0.clone();

		Box::pin(async move {
			map.write().remove(key);

			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn set_get_clear_cycle() {
		let store = MemoryPersistence::default();

		store.set("k", "v1".into()).await.expect("Set should succeed.");
		store.set("k", "v2".into()).await.expect("Overwrite should succeed.");

		assert_eq!(store.get("k").await.expect("Get should succeed."), Some("v2".into()));
		assert_eq!(store.len(), 1);

		store.clear("k").await.expect("Clear should succeed.");
		store.clear("k").await.expect("Clearing a missing key should succeed.");

		assert!(store.is_empty());
		assert_eq!(store.get("k").await.expect("Get should succeed."), None);
	}
}
