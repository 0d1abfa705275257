#![cfg(feature = "reqwest")]

// std
use std::{sync::Arc, time::Duration as StdDuration};
// crates.io
use httpmock::prelude::*;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tokio::{sync::broadcast::error::TryRecvError, task::JoinSet};
// self
use backoffice_session::{
	auth::{AccessToken, CustomerId, RefreshToken},
	config::SessionConfig,
	error::{Error, RefreshError},
	exchange::SignInRequest,
	http::ReqwestTransport,
	idempotency::IdempotencyKey,
	pipeline::{ApiClient, ApiRequest, ReqwestApiClient, SessionEvent, SignOutReason},
	session::{SESSION_KEY, SessionStore},
	store::{MemoryPersistence, SessionPersistence, StoreFuture},
	url::Url,
};

fn build_client(server: &MockServer) -> (ReqwestApiClient, Arc<MemoryPersistence>) {
	let config = SessionConfig::new(
		Url::parse(&server.base_url()).expect("Mock server base URL should parse."),
	);
	let persistence = Arc::new(MemoryPersistence::default());
	let session = Arc::new(SessionStore::new(persistence.clone(), config.token_skew));
	let transport =
		ReqwestTransport::from_config(&config).expect("Reqwest transport should build for tests.");

	(ApiClient::with_transport(config, session, Arc::new(transport)), persistence)
}

/// Persistence whose writes never complete.
struct StalledPersistence;
impl SessionPersistence for StalledPersistence {
	fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<String>> {
		Box::pin(async { Ok(None) })
	}

	fn set<'a>(&'a self, _key: &'a str, _value: String) -> StoreFuture<'a, ()> {
		Box::pin(std::future::pending())
	}

	fn clear<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(std::future::pending())
	}
}

fn customer() -> CustomerId {
	CustomerId::new("CUST-001").expect("Customer fixture should be valid.")
}

fn expires_in_ms(duration: Duration) -> i64 {
	let instant = OffsetDateTime::now_utc() + duration;

	(instant.unix_timestamp_nanos() / 1_000_000) as i64
}

async fn seed(client: &ReqwestApiClient, access: &str, expires_at: OffsetDateTime) {
	client
		.session()
		.set_session(
			AccessToken::new(access),
			Some(RefreshToken::new("r-1")),
			expires_at,
			Some(customer()),
		)
		.await;
}

#[tokio::test]
async fn sign_in_then_sign_out_round_trip() -> color_eyre::Result<()> {
	let server = MockServer::start_async().await;
	let login = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/auth/login")
				.json_body(json!({ "customerId": "CUST-001", "token": "otp-42" }));
			then.status(200).json_body(json!({
				"accessToken": "a-1",
				"refreshToken": "r-1",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let (client, persistence) = build_client(&server);
	let mut events = client.subscribe();
	let session = client.sign_in(SignInRequest::new(customer()).with_credential("otp-42")).await?;

	login.assert_calls_async(1).await;

	assert_eq!(session.subject.as_deref(), Some("CUST-001"));
	assert!(client.session().is_authenticated());

	client.session().flush().await;

	assert!(persistence.peek(SESSION_KEY).is_some());
	assert_eq!(events.try_recv()?, SessionEvent::SignedIn { subject: customer() });

	client.sign_out().await;
	client.session().flush().await;

	assert!(!client.session().is_authenticated());
	assert!(client.session().snapshot().is_none());
	assert!(persistence.peek(SESSION_KEY).is_none());
	assert_eq!(
		events.try_recv()?,
		SessionEvent::SignedOut { reason: SignOutReason::UserRequested }
	);

	Ok(())
}

#[tokio::test]
async fn rejected_sign_in_leaves_store_empty() {
	let server = MockServer::start_async().await;
	let _login = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/login");
			then.status(401).json_body(json!({ "message": "Invalid credentials" }));
		})
		.await;
	let (client, persistence) = build_client(&server);
	let err = client
		.sign_in(SignInRequest::new(customer()))
		.await
		.expect_err("Sign-in should be rejected.");

	assert!(matches!(err, Error::SignIn { status: 401, ref message } if message == "Invalid credentials"));
	assert!(client.session().snapshot().is_none());
	assert!(persistence.is_empty());
}

#[tokio::test]
async fn expired_token_is_refreshed_once_before_success() {
	let server = MockServer::start_async().await;
	let rejected = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders").header_missing("authorization");
			then.status(401).json_body(json!({ "message": "Unauthorized" }));
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh").json_body(json!({ "refreshToken": "r-1" }));
			then.status(200).json_body(json!({
				"accessToken": "a-2",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let accepted = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders").header("authorization", "Bearer a-2");
			then.status(200).json_body(json!([{ "id": 1, "totalCents": 1999 }]));
		})
		.await;
	let (client, _) = build_client(&server);

	seed(&client, "a-1", OffsetDateTime::now_utc() - Duration::minutes(2)).await;

	let response = client.get("/api/orders").await.expect("Request should succeed after refresh.");
	let orders: serde_json::Value = response.json().expect("Orders payload should decode.");

	assert_eq!(orders[0]["totalCents"], 1999);
	rejected.assert_calls_async(1).await;
	refresh.assert_calls_async(1).await;
	accepted.assert_calls_async(1).await;
	assert_eq!(client.refresh_metrics().attempts(), 1);
	assert_eq!(
		client.session().valid_access_token().as_ref().map(AccessToken::expose),
		Some("a-2")
	);
	assert_eq!(client.session().refresh_token().as_ref().map(RefreshToken::expose), Some("r-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unauthorized_calls_share_one_refresh() {
	let server = MockServer::start_async().await;
	let _rejected = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/dashboard").header("authorization", "Bearer a-1");
			then.status(401);
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(200).delay(StdDuration::from_millis(200)).json_body(json!({
				"accessToken": "a-2",
				"refreshToken": "r-2",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let accepted = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/dashboard").header("authorization", "Bearer a-2");
			then.status(200).json_body(json!({ "revenueCents": 120000 }));
		})
		.await;
	let (client, _) = build_client(&server);

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;

	let mut tasks = JoinSet::new();

	for _ in 0..6 {
		let client = client.clone();

		tasks.spawn(async move { client.get("/api/dashboard").await });
	}

	while let Some(joined) = tasks.join_next().await {
		let response = joined
			.expect("Request task should not panic.")
			.expect("Every request should succeed after the shared refresh.");

		assert!(response.status().is_success());
	}

	refresh.assert_calls_async(1).await;
	accepted.assert_calls_async(6).await;
	assert_eq!(client.refresh_metrics().attempts(), 1);
	assert_eq!(client.session().refresh_token().as_ref().map(RefreshToken::expose), Some("r-2"));
}

#[tokio::test]
async fn unauthorized_resend_ends_the_session() -> color_eyre::Result<()> {
	let server = MockServer::start_async().await;
	let orders = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders");
			then.status(401).json_body(json!({ "message": "Unauthorized" }));
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(200).json_body(json!({
				"accessToken": "a-2",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let (client, persistence) = build_client(&server);
	let mut events = client.subscribe();

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;

	let err = client.get("/api/orders").await.expect_err("Second 401 must not be retried.");

	assert!(matches!(err, Error::Unauthorized));
	assert!(err.is_session_fatal());
	orders.assert_calls_async(2).await;
	refresh.assert_calls_async(1).await;
	client.session().flush().await;

	assert!(client.session().snapshot().is_none());
	assert!(persistence.peek(SESSION_KEY).is_none());
	assert_eq!(
		events.try_recv()?,
		SessionEvent::SignInRequired {
			reason: SignOutReason::Unauthorized,
			redirect_to: SessionConfig::DEFAULT_SIGN_IN_PATH.into(),
		}
	);

	Ok(())
}

#[tokio::test]
async fn failed_refresh_clears_the_session() -> color_eyre::Result<()> {
	let server = MockServer::start_async().await;
	let orders = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders");
			then.status(401);
		})
		.await;
	let _refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(401).json_body(json!({ "message": "Invalid refresh token" }));
		})
		.await;
	let (client, persistence) = build_client(&server);
	let mut events = client.subscribe();

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;

	let err = client.get("/api/orders").await.expect_err("Request should fail when refresh fails.");

	assert!(matches!(
		err,
		Error::Refresh(RefreshError::Rejected { status: 401, ref message })
			if message == "Invalid refresh token"
	));
	orders.assert_calls_async(1).await;
	client.session().flush().await;

	assert!(client.session().snapshot().is_none());
	assert!(persistence.peek(SESSION_KEY).is_none());
	assert!(matches!(
		events.try_recv()?,
		SessionEvent::SignInRequired { reason: SignOutReason::RefreshFailed, .. }
	));

	Ok(())
}

#[tokio::test]
async fn resend_reuses_the_idempotency_key() {
	let server = MockServer::start_async().await;
	let rejected = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/orders")
				.header("authorization", "Bearer a-1")
				.header("idempotency-key", "order-7f3a");
			then.status(401);
		})
		.await;
	let _refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(200).json_body(json!({
				"accessToken": "a-2",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let created = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/orders")
				.header("authorization", "Bearer a-2")
				.header("idempotency-key", "order-7f3a")
				.json_body(json!({ "sku": "SKU-1", "quantity": 2 }));
			then.status(201).json_body(json!({ "id": 7 }));
		})
		.await;
	let (client, _) = build_client(&server);

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;

	let request = ApiRequest::post("/api/orders")
		.json(&json!({ "sku": "SKU-1", "quantity": 2 }))
		.expect("Order body should serialize.")
		.idempotency_key(IdempotencyKey::from_caller("order-7f3a"));
	let response = client.send(request).await.expect("Order should be created on resend.");

	assert_eq!(response.status().as_u16(), 201);
	rejected.assert_calls_async(1).await;
	created.assert_calls_async(1).await;
}

#[tokio::test]
async fn mutations_carry_a_generated_key_and_reads_do_not() {
	let server = MockServer::start_async().await;
	let patch = server
		.mock_async(|when, then| {
			when.method(PATCH).path("/api/inventory/SKU-1").header_exists("idempotency-key");
			then.status(200).json_body(json!({ "stock": 4 }));
		})
		.await;
	let read = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/inventory").header_missing("idempotency-key");
			then.status(200).json_body(json!([]));
		})
		.await;
	let (client, _) = build_client(&server);

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;
	client
		.patch("/api/inventory/SKU-1", &json!({ "delta": -1 }))
		.await
		.expect("Patch should succeed.");
	client.get("/api/inventory").await.expect("Read should succeed.");

	patch.assert_calls_async(1).await;
	read.assert_calls_async(1).await;
}

#[tokio::test]
async fn non_auth_failures_propagate_without_side_effects() {
	let server = MockServer::start_async().await;
	let failing = server
		.mock_async(|when, then| {
			when.method(DELETE).path("/api/orders/9");
			then.status(409).json_body(json!({ "message": "Order already shipped" }));
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(200);
		})
		.await;
	let (client, _) = build_client(&server);

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;

	let err = client.delete("/api/orders/9").await.expect_err("Conflict should surface.");

	assert!(matches!(err, Error::Api { status: 409, ref message } if message == "Order already shipped"));
	assert!(!err.is_session_fatal());
	failing.assert_calls_async(1).await;
	refresh.assert_calls_async(0).await;
	assert!(client.session().is_authenticated());
}

#[tokio::test]
async fn stalled_persistence_does_not_delay_requests() {
	let server = MockServer::start_async().await;
	let _rejected = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders").header_missing("authorization");
			then.status(401);
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(200).json_body(json!({
				"accessToken": "a-2",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let accepted = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders").header("authorization", "Bearer a-2");
			then.status(200).json_body(json!([]));
		})
		.await;
	let config = SessionConfig::new(
		Url::parse(&server.base_url()).expect("Mock server base URL should parse."),
	);
	let session = Arc::new(SessionStore::new(Arc::new(StalledPersistence), config.token_skew));
	let transport =
		ReqwestTransport::from_config(&config).expect("Reqwest transport should build for tests.");
	let client = ApiClient::with_transport(config, session, Arc::new(transport));

	tokio::time::timeout(
		StdDuration::from_secs(3),
		seed(&client, "a-1", OffsetDateTime::now_utc() - Duration::minutes(2)),
	)
	.await
	.expect("Seeding should not wait for persistence.");

	let response = tokio::time::timeout(StdDuration::from_secs(3), client.get("/api/orders"))
		.await
		.expect("Request should not wait for persistence.")
		.expect("Request should succeed after refresh.");

	assert!(response.status().is_success());
	refresh.assert_calls_async(1).await;
	accepted.assert_calls_async(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_token_concurrent_calls_share_one_refresh() {
	let server = MockServer::start_async().await;
	let anonymous = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders").header_missing("authorization");
			then.status(401);
		})
		.await;
	let late_anonymous = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/inventory").header_missing("authorization");
			then.status(401).delay(StdDuration::from_millis(800));
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(200).delay(StdDuration::from_millis(200)).json_body(json!({
				"accessToken": "a-2",
				"expiresAt": expires_in_ms(Duration::hours(1)),
			}));
		})
		.await;
	let orders = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders").header("authorization", "Bearer a-2");
			then.status(200).json_body(json!([]));
		})
		.await;
	let inventory = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/inventory").header("authorization", "Bearer a-2");
			then.status(200).json_body(json!([]));
		})
		.await;
	let (client, _) = build_client(&server);

	seed(&client, "a-1", OffsetDateTime::now_utc() - Duration::minutes(2)).await;

	let mut tasks = JoinSet::new();

	for _ in 0..5 {
		let client = client.clone();

		tasks.spawn(async move { client.get("/api/orders").await });
	}

	// Sent anonymously now; its 401 only arrives once the shared refresh has finished.
	tasks.spawn({
		let client = client.clone();

		async move { client.get("/api/inventory").await }
	});

	while let Some(joined) = tasks.join_next().await {
		let response = joined
			.expect("Request task should not panic.")
			.expect("Every request should succeed with the refreshed token.");

		assert!(response.status().is_success());
	}

	anonymous.assert_calls_async(5).await;
	late_anonymous.assert_calls_async(1).await;
	refresh.assert_calls_async(1).await;
	orders.assert_calls_async(5).await;
	inventory.assert_calls_async(1).await;
	assert_eq!(client.refresh_metrics().attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_refresh_failure_announces_sign_in_once() {
	let server = MockServer::start_async().await;
	let _orders = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/orders");
			then.status(401);
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/refresh");
			then.status(401).delay(StdDuration::from_millis(200));
		})
		.await;
	let (client, _) = build_client(&server);
	let mut events = client.subscribe();

	seed(&client, "a-1", OffsetDateTime::now_utc() + Duration::hours(1)).await;

	let mut tasks = JoinSet::new();

	for _ in 0..4 {
		let client = client.clone();

		tasks.spawn(async move { client.get("/api/orders").await });
	}

	while let Some(joined) = tasks.join_next().await {
		let err = joined.expect("Request task should not panic.").expect_err("Refresh should fail.");

		assert!(err.is_session_fatal());
	}

	refresh.assert_calls_async(1).await;
	assert!(matches!(
		events.try_recv(),
		Ok(SessionEvent::SignInRequired { reason: SignOutReason::RefreshFailed, .. })
	));
	assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
	assert!(client.session().snapshot().is_none());
}
