//! Token Store: the process-wide session state shared by the pipeline and refresh coordinator.
//!
//! Reads are synchronous snapshots so request handling never waits on storage. Mutations
//! (sign-in, refresh, sign-out) swap the in-memory session atomically and return; writing the
//! latest snapshot happens on a spawned task. Writes are serialized and each one stores whatever
//! is in memory when it runs, so the last write always reflects the latest state. Persistence
//! failures are logged and swallowed. Mutations must run inside a Tokio runtime.

// self
use crate::{
	_prelude::*,
	auth::{AccessToken, CustomerId, RefreshToken, Session},
	obs,
	store::{SessionPersistence, StoreError},
};

/// Persistence key under which the session snapshot is stored.
pub const SESSION_KEY: &str = "backoffice.session";

/// Result of a refresh-token compare-and-swap attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareAndSwapOutcome {
	/// The stored refresh token matched and the session was replaced.
	Updated,
	/// A session exists but carries a different refresh token; the stored session is returned.
	RefreshMismatch(Session),
	/// No session is stored.
	Missing,
}

type SharedState = Arc<RwLock<Option<Session>>>;

/// Shared, persisted session state.
pub struct SessionStore {
	state: SharedState,
	persistence: Arc<dyn SessionPersistence>,
	persist_guard: Arc<AsyncMutex<()>>,
	skew: Duration,
}
impl SessionStore {
	/// Default safety margin subtracted from the expiry before a token is considered unusable.
	pub const DEFAULT_SKEW: Duration = Duration::seconds(60);
	/// Largest accepted safety margin.
	pub const MAX_SKEW: Duration = Duration::days(1);

	/// Creates an empty store writing through to `persistence`.
	///
	/// The skew is clamped to `0..=MAX_SKEW`.
	pub fn new(persistence: Arc<dyn SessionPersistence>, skew: Duration) -> Self {
		Self {
			state: Arc::new(RwLock::new(None)),
			persistence,
			persist_guard: Arc::new(AsyncMutex::new(())),
			skew: Self::clamp_skew(skew),
		}
	}

	/// Clamps `skew` to `0..=MAX_SKEW`.
	pub fn clamp_skew(skew: Duration) -> Duration {
		skew.clamp(Duration::ZERO, Self::MAX_SKEW)
	}

	/// Creates a store and loads any previously persisted session.
	///
	/// Unreadable snapshots are discarded so a corrupt entry never blocks start-up.
	pub async fn restore(persistence: Arc<dyn SessionPersistence>, skew: Duration) -> Self {
		let store = Self::new(persistence, skew);

		match store.load().await {
			Ok(Some(session)) => *store.state.write() = Some(session),
			Ok(None) => {},
			Err(err) => {
				obs::log_warn!(error = %err, "Discarding unreadable persisted session.");

				let _ = store.persistence.clear(SESSION_KEY).await;
			},
		}

		store
	}

	/// Safety margin applied by [`SessionStore::valid_access_token`].
	pub fn skew(&self) -> Duration {
		self.skew
	}

	/// Replaces the current session atomically with the provided fields.
	pub async fn set_session(
		&self,
		access_token: AccessToken,
		refresh_token: Option<RefreshToken>,
		expires_at: OffsetDateTime,
		subject: Option<CustomerId>,
	) {
		self.replace(Session {
			access_token,
			refresh_token,
			subject,
			issued_at: OffsetDateTime::now_utc(),
			expires_at,
		})
		.await;
	}

	/// Replaces the current session atomically.
	pub async fn replace(&self, session: Session) {
		*self.state.write() = Some(session);

		self.schedule_persist();
	}

	/// Returns a copy of the current session, if any.
	pub fn snapshot(&self) -> Option<Session> {
		self.state.read().clone()
	}

	/// Returns the access token only if it stays valid beyond the safety margin right now.
	pub fn valid_access_token(&self) -> Option<AccessToken> {
		self.valid_access_token_at(OffsetDateTime::now_utc())
	}

	/// Returns the access token only if `instant < expires_at - skew`.
	pub fn valid_access_token_at(&self, instant: OffsetDateTime) -> Option<AccessToken> {
		self.state
			.read()
			.as_ref()
			.and_then(|session| session.usable_access_token_at(instant, self.skew))
			.cloned()
	}

	/// Returns the stored refresh token, if any.
	pub fn refresh_token(&self) -> Option<RefreshToken> {
		self.state.read().as_ref().and_then(|session| session.refresh_token.clone())
	}

	/// Returns the signed-in customer, if known.
	pub fn subject(&self) -> Option<CustomerId> {
		self.state.read().as_ref().and_then(|session| session.subject.clone())
	}

	/// Returns `true` iff an access token is stored and has not expired.
	pub fn is_authenticated(&self) -> bool {
		self.is_authenticated_at(OffsetDateTime::now_utc())
	}

	/// Returns `true` iff an access token is stored and `instant` is before its expiry.
	pub fn is_authenticated_at(&self, instant: OffsetDateTime) -> bool {
		self.state.read().as_ref().is_some_and(|session| session.is_authenticated_at(instant))
	}

	/// Wipes every session field and the persisted snapshot.
	///
	/// Returns `true` if a session was present.
	pub async fn clear(&self) -> bool {
		let removed = self.state.write().take().is_some();

		self.schedule_persist();

		removed
	}

	/// Writes the current session to persistence and waits for the write to finish.
	pub async fn flush(&self) {
		Self::persist(&self.state, self.persistence.as_ref(), &self.persist_guard).await;
	}

	/// Installs `replacement` only if the stored session still carries `expected` as its
	/// refresh token.
	pub async fn compare_and_swap_refresh(
		&self,
		expected: &RefreshToken,
		replacement: Session,
	) -> CompareAndSwapOutcome {
		let outcome = {
			let mut guard = self.state.write();

			match guard.take() {
				Some(current) if current.refresh_token.as_ref() == Some(expected) => {
					*guard = Some(replacement);

					CompareAndSwapOutcome::Updated
				},
				Some(current) => {
					*guard = Some(current.clone());

					CompareAndSwapOutcome::RefreshMismatch(current)
				},
				None => CompareAndSwapOutcome::Missing,
			}
		};

		if matches!(outcome, CompareAndSwapOutcome::Updated) {
			self.schedule_persist();
		}

		outcome
	}

	async fn load(&self) -> Result<Option<Session>, StoreError> {
		let Some(raw) = self.persistence.get(SESSION_KEY).await? else {
			return Ok(None);
		};

		serde_json::from_str(&raw)
			.map(Some)
			.map_err(|e| StoreError::Serialization { message: e.to_string() })
	}

	fn schedule_persist(&self) {
		let state = self.state.clone();
		let persistence = self.persistence.clone();
		let guard = self.persist_guard.clone();

		tokio::spawn(async move { Self::persist(&state, persistence.as_ref(), &guard).await });
	}

	// The snapshot is taken under the guard, after any earlier write finished.
	async fn persist(
		state: &RwLock<Option<Session>>,
		persistence: &dyn SessionPersistence,
		guard: &AsyncMutex<()>,
	) {
		let _guard = guard.lock().await;
		let snapshot = state.read().clone();
		let result = match snapshot {
			Some(session) => match serde_json::to_string(&session) {
				Ok(raw) => persistence.set(SESSION_KEY, raw).await,
				Err(e) => Err(StoreError::Serialization { message: e.to_string() }),
			},
			None => persistence.clear(SESSION_KEY).await,
		};

		if let Err(err) = result {
			obs::log_warn!(error = %err, "Failed to persist session snapshot.");
		}
	}
}
impl Debug for SessionStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SessionStore")
			.field("session", &*self.state.read())
			.field("skew", &self.skew)
			.finish()
	}
}
