//! Session and resilience layer for back-office dashboards: token lifecycle with coalesced
//! refresh, idempotent mutations, and a self-healing realtime invalidation channel.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod config;
pub mod error;
pub mod exchange;
pub mod http;
pub mod idempotency;
pub mod obs;
pub mod offline;
pub mod pipeline;
pub mod realtime;
pub mod refresh;
pub mod session;
pub mod store;
#[cfg(all(any(test, feature = "test"), feature = "reqwest"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// self
	use crate::{
		config::SessionConfig,
		http::ReqwestTransport,
		pipeline::{ApiClient, ReqwestApiClient},
		session::SessionStore,
		store::MemoryPersistence,
	};

	/// Builds an [`ApiClient`] against `base_url` backed by in-memory persistence.
	///
	/// Returns the client together with the persistence backend so tests can inspect what the
	/// Token Store wrote.
	pub fn build_test_client(base_url: &str) -> (ReqwestApiClient, Arc<MemoryPersistence>) {
		let base_url = Url::parse(base_url).expect("Test base URL should parse.");
		let config = SessionConfig::new(base_url);
		let persistence = Arc::new(MemoryPersistence::default());
		let session = Arc::new(SessionStore::new(persistence.clone(), config.token_skew));
		let transport = ReqwestTransport::from_config(&config)
			.expect("Failed to build reqwest transport for tests.");
		let client = ApiClient::with_transport(config, session, Arc::new(transport));

		(client, persistence)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap, HashSet},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::Duration as StdDuration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(all(test, feature = "reqwest"))] use {color_eyre as _, httpmock as _};
