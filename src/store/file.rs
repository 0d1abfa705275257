//! File-backed [`SessionPersistence`] so sessions survive process restarts.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	store::{SessionPersistence, StoreError, StoreFuture},
};

/// Persists entries to a JSON object file after each mutation.
///
/// File I/O runs on Tokio's blocking pool; writes are serialized so the file always ends up
/// holding the latest map.
#[derive(Clone, Debug)]
pub struct FilePersistence {
	path: PathBuf,
	inner: Arc<RwLock<BTreeMap<String, String>>>,
	write_guard: Arc<AsyncMutex<()>>,
}
impl FilePersistence {
	/// Opens (or creates) a store at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();

		Self::ensure_parent_exists(&path)?;

		let snapshot = Self::load_snapshot(&path)?;

		Ok(Self {
			path,
			inner: Arc::new(RwLock::new(snapshot)),
			write_guard: Arc::new(AsyncMutex::new(())),
		})
	}

	/// Returns the backing file path.
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn load_snapshot(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
		if !path.exists() {
			return Ok(BTreeMap::new());
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;

		if bytes.is_empty() {
			return Ok(BTreeMap::new());
		}

		serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
			message: format!("Failed to parse {}: {e}", path.display()),
		})
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create store directory {}: {e}", parent.display()),
			})?;
		}

		Ok(())
	}

	async fn write_latest(&self) -> Result<(), StoreError> {
		let path = self.path.clone();
		let contents = self.inner.read().clone();

		tokio::task::spawn_blocking(move || Self::write_snapshot(&path, &contents))
			.await
			.map_err(|e| StoreError::Backend { message: format!("Store writer task failed: {e}") })?
	}

	fn write_snapshot(path: &Path, contents: &BTreeMap<String, String>) -> Result<(), StoreError> {
		let serialized =
			serde_json::to_vec_pretty(contents).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize store snapshot: {e}"),
			})?;
		let mut tmp_path = path.to_path_buf();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", path.display()),
		})
	}
}
impl SessionPersistence for FilePersistence {
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
		Box::pin(async move { Ok(self.inner.read().get(key).cloned()) })
	}

	fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let _writer = self.write_guard.lock().await;

			self.inner.write().insert(key.to_owned(), value);
			self.write_latest().await
		})
	}

	fn clear<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let _writer = self.write_guard.lock().await;
			let removed = self.inner.write().remove(key).is_some();

			if removed {
				self.write_latest().await?;
			}

			Ok(())
		})
	}
}
