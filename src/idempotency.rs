//! Idempotency keys attached to mutating requests so the backend can deduplicate retries.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use rand::Rng;
// self
use crate::_prelude::*;

/// Header carrying the idempotency key. Header lookups are case-insensitive.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

const RANDOM_SUFFIX_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Single-use key identifying one logical mutating request.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);
impl IdempotencyKey {
	/// Generates a fresh key: `idem_<unix_ms>_<sequence>_<random>`.
	///
	/// The process-wide sequence keeps keys distinct even when the clock stalls or repeats.
	pub fn generate() -> Self {
		let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
		let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);

		Self(format!("idem_{millis}_{}_{}", to_base36(sequence), random_base36(RANDOM_SUFFIX_LEN)))
	}

	/// Wraps a caller-supplied key.
	pub fn from_caller(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the key as sent on the wire.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl AsRef<str> for IdempotencyKey {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl Debug for IdempotencyKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "IdempotencyKey({})", self.0)
	}
}
impl Display for IdempotencyKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

pub(crate) fn random_base36(len: usize) -> String {
	let mut rng = rand::rng();

	(0..len).map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())])).collect()
}

fn to_base36(mut value: u64) -> String {
	if value == 0 {
		return "0".into();
	}

	let mut digits = Vec::new();

	while value > 0 {
		digits.push(BASE36[(value % 36) as usize]);
		value /= 36;
	}

	digits.iter().rev().map(|&b| char::from(b)).collect()
}
