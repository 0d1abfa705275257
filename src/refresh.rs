//! Refresh Coordinator: collapses concurrent refresh demands into one exchange.
//!
//! The first caller installs an in-flight marker and drives the exchange; everyone who arrives
//! while it is pending awaits the same cell and receives a clone of the same outcome. Checking
//! for and installing the marker happens under one lock, so two callers can never both decide
//! they are first. Results are applied to the Token Store with a refresh-token compare-and-swap:
//! a sign-out that lands mid-refresh is never undone, and a newer stored session always wins.
//! The coordinator never clears the session itself; that decision belongs to the pipeline.

mod metrics;

pub use metrics::RefreshMetrics;

// crates.io
use async_lock::OnceCell;
// self
use crate::{
	_prelude::*,
	auth::{AccessToken, Session},
	error::RefreshError,
	exchange::TokenExchange,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	session::{CompareAndSwapOutcome, SessionStore},
};

type RefreshOutcome = Result<Session, RefreshError>;
type InFlight = Arc<OnceCell<RefreshOutcome>>;

/// Deduplicates refresh exchanges and applies their results to the Token Store.
pub struct RefreshCoordinator {
	session: Arc<SessionStore>,
	exchange: Arc<dyn TokenExchange>,
	in_flight: Mutex<Option<InFlight>>,
	metrics: Arc<RefreshMetrics>,
}
impl RefreshCoordinator {
	/// Creates a coordinator refreshing `session` through `exchange`.
	pub fn new(session: Arc<SessionStore>, exchange: Arc<dyn TokenExchange>) -> Self {
		Self {
			session,
			exchange,
			in_flight: Mutex::new(None),
			metrics: Arc::new(RefreshMetrics::default()),
		}
	}

	/// Counters describing refresh activity.
	pub fn metrics(&self) -> &Arc<RefreshMetrics> {
		&self.metrics
	}

	/// Returns `true` while a refresh exchange is pending.
	pub fn is_refreshing(&self) -> bool {
		self.in_flight.lock().as_ref().is_some_and(|cell| !cell.is_initialized())
	}

	/// Obtains a new access token, joining any refresh already in flight.
	pub async fn refresh(&self) -> Result<AccessToken, RefreshError> {
		let (cell, leader) = {
			let mut slot = self.in_flight.lock();

			match slot.as_ref() {
				Some(cell) => (cell.clone(), false),
				None => {
					let cell = Arc::new(OnceCell::new());

					*slot = Some(cell.clone());

					(cell, true)
				},
			}
		};

		if !leader {
			self.metrics.record_coalesced();
		}

		let outcome = cell.get_or_init(|| self.exchange_and_apply()).await.clone();

		{
			let mut slot = self.in_flight.lock();

			if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &cell)) {
				*slot = None;
			}
		}

		outcome.map(|session| session.access_token)
	}

	/// Obtains a token to retry a call that was rejected while carrying `rejected`.
	///
	/// When the store already holds a valid token that differs from the rejected one, another
	/// caller has refreshed in the meantime and that token is returned without a new exchange.
	pub async fn refresh_after(
		&self,
		rejected: Option<&AccessToken>,
	) -> Result<AccessToken, RefreshError> {
		match self.session.valid_access_token() {
			Some(current) if Some(&current) != rejected => {
				obs::log_debug!("Reusing access token refreshed by a concurrent call.");

				Ok(current)
			},
			_ => self.refresh().await,
		}
	}

	async fn exchange_and_apply(&self) -> RefreshOutcome {
		const KIND: FlowKind = FlowKind::Refresh;

		let span = FlowSpan::new(KIND, "exchange_and_apply");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async {
				let current = self.session.snapshot().ok_or(RefreshError::MissingRefreshToken)?;
				let expected =
					current.refresh_token.clone().ok_or(RefreshError::MissingRefreshToken)?;

				self.metrics.record_attempt();

				let grant = self.exchange.refresh(&expected).await?;
				let updated = current.refreshed(
					grant.access_token,
					grant.expires_at,
					grant.refresh_token,
					OffsetDateTime::now_utc(),
				);

				match self.session.compare_and_swap_refresh(&expected, updated.clone()).await {
					CompareAndSwapOutcome::Updated => Ok(updated),
					CompareAndSwapOutcome::RefreshMismatch(stored) => Ok(stored),
					CompareAndSwapOutcome::Missing => Err(RefreshError::SessionEnded),
				}
			})
			.await;

		match &result {
			Ok(_) => self.metrics.record_success(),
			Err(_) => self.metrics.record_failure(),
		}

		obs::record_flow_outcome(KIND, FlowOutcome::of(&result));

		result
	}
}
impl Debug for RefreshCoordinator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RefreshCoordinator")
			.field("refreshing", &self.is_refreshing())
			.field("metrics", &self.metrics)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// crates.io
	use tokio::task::JoinSet;
	// self
	use super::*;
	use crate::{
		auth::{CustomerId, RefreshToken},
		exchange::{ExchangeFuture, SignInRequest, TokenGrant},
		store::MemoryPersistence,
	};

	struct CountingExchange {
		calls: AtomicUsize,
		latency: StdDuration,
		outcome: Result<TokenGrant, RefreshError>,
	}
	impl CountingExchange {
		fn granting(access: &str, rotated: Option<&str>) -> Arc<Self> {
			Arc::new(Self {
				calls: AtomicUsize::new(0),
				latency: StdDuration::from_millis(50),
				outcome: Ok(TokenGrant {
					access_token: AccessToken::new(access),
					refresh_token: rotated.map(RefreshToken::new),
					expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
				}),
			})
		}

		fn failing(err: RefreshError) -> Arc<Self> {
			Arc::new(Self {
				calls: AtomicUsize::new(0),
				latency: StdDuration::from_millis(50),
				outcome: Err(err),
			})
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}
	impl TokenExchange for CountingExchange {
		fn sign_in<'a>(&'a self, _request: &'a SignInRequest) -> ExchangeFuture<'a, TokenGrant> {
			Box::pin(async { Err(Error::SignIn { status: 501, message: "unsupported".into() }) })
		}

		fn refresh<'a>(
			&'a self,
			_refresh_token: &'a RefreshToken,
		) -> ExchangeFuture<'a, TokenGrant, RefreshError> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			Box::pin(async move {
				tokio::time::sleep(self.latency).await;

				self.outcome.clone()
			})
		}
	}

	async fn expired_store(refresh: Option<&str>) -> Arc<SessionStore> {
		let store = Arc::new(SessionStore::new(
			Arc::new(MemoryPersistence::default()),
			SessionStore::DEFAULT_SKEW,
		));
		let session = Session::builder()
			.access_token("expired")
			.maybe_refresh_token(refresh.map(RefreshToken::new))
			.subject(CustomerId::new("CUST-001").expect("Customer fixture should be valid."))
			.expires_at(OffsetDateTime::now_utc() - Duration::minutes(2))
			.build()
			.expect("Session fixture should build.");

		store.replace(session).await;

		store
	}

	#[tokio::test(start_paused = true)]
	async fn concurrent_callers_share_one_exchange() {
		let store = expired_store(Some("r-1")).await;
		let exchange = CountingExchange::granting("fresh", None);
		let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange.clone()));
		let mut tasks = JoinSet::new();

		for _ in 0..10 {
			let coordinator = coordinator.clone();

			tasks.spawn(async move { coordinator.refresh().await });
		}

		while let Some(joined) = tasks.join_next().await {
			let token = joined.expect("Task should not panic.").expect("Refresh should succeed.");

			assert_eq!(token.expose(), "fresh");
		}

		assert_eq!(exchange.calls(), 1);
		assert_eq!(coordinator.metrics().attempts(), 1);
		assert_eq!(coordinator.metrics().coalesced(), 9);
		assert!(!coordinator.is_refreshing());

		let session = store.snapshot().expect("Refreshed session should be stored.");

		assert_eq!(session.refresh_token.as_ref().map(RefreshToken::expose), Some("r-1"));
		assert_eq!(session.subject.as_deref(), Some("CUST-001"));
	}

	#[tokio::test(start_paused = true)]
	async fn rotated_refresh_token_replaces_stored_one() {
		let store = expired_store(Some("r-1")).await;
		let coordinator =
			RefreshCoordinator::new(store.clone(), CountingExchange::granting("fresh", Some("r-2")));

		coordinator.refresh().await.expect("Refresh should succeed.");

		assert_eq!(store.refresh_token().as_ref().map(RefreshToken::expose), Some("r-2"));
		assert_eq!(store.valid_access_token().as_ref().map(AccessToken::expose), Some("fresh"));
	}

	#[tokio::test]
	async fn missing_refresh_token_fails_without_exchange() {
		let store = expired_store(None).await;
		let exchange = CountingExchange::granting("fresh", None);
		let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

		assert_eq!(coordinator.refresh().await, Err(RefreshError::MissingRefreshToken));
		assert_eq!(exchange.calls(), 0);
		assert_eq!(coordinator.metrics().attempts(), 0);
		assert_eq!(coordinator.metrics().failures(), 1);
		assert!(store.snapshot().is_some(), "Coordinator must not clear the session.");
	}

	#[tokio::test(start_paused = true)]
	async fn failure_fans_out_to_every_caller() {
		let store = expired_store(Some("r-1")).await;
		let rejection = RefreshError::Rejected { status: 401, message: "Token revoked".into() };
		let exchange = CountingExchange::failing(rejection.clone());
		let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());
		let (a, b, c) =
			tokio::join!(coordinator.refresh(), coordinator.refresh(), coordinator.refresh());

		assert_eq!(a, Err(rejection.clone()));
		assert_eq!(b, Err(rejection.clone()));
		assert_eq!(c, Err(rejection));
		assert_eq!(exchange.calls(), 1);
		assert_eq!(coordinator.metrics().failures(), 1);
		assert!(store.snapshot().is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn sign_out_during_refresh_is_not_undone() {
		let store = expired_store(Some("r-1")).await;
		let coordinator = Arc::new(RefreshCoordinator::new(
			store.clone(),
			CountingExchange::granting("fresh", None),
		));
		let pending = tokio::spawn({
			let coordinator = coordinator.clone();

			async move { coordinator.refresh().await }
		});

		tokio::task::yield_now().await;
		assert!(coordinator.is_refreshing());
		store.clear().await;

		let outcome = pending.await.expect("Task should not panic.");

		assert_eq!(outcome, Err(RefreshError::SessionEnded));
		assert!(store.snapshot().is_none());
	}

	#[tokio::test]
	async fn newer_token_short_circuits_refresh() {
		let store = expired_store(Some("r-1")).await;
		let exchange = CountingExchange::granting("unused", None);
		let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

		store
			.set_session(
				AccessToken::new("newer"),
				Some(RefreshToken::new("r-2")),
				OffsetDateTime::now_utc() + Duration::hours(1),
				None,
			)
			.await;

		let stale = AccessToken::new("expired");
		let token = coordinator.refresh_after(Some(&stale)).await.expect("Reuse should succeed.");

		assert_eq!(token.expose(), "newer");
		assert_eq!(exchange.calls(), 0);
	}
}
