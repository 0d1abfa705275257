//! Session record, lifecycle status, and builder.

// self
use crate::{
	_prelude::*,
	auth::{AccessToken, CustomerId, RefreshToken},
};

/// Lifecycle status of a session at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
	/// Access token is valid beyond the safety margin.
	Active,
	/// Access token is still valid but inside the safety margin; it must not be sent.
	Expiring,
	/// Access token has expired.
	Expired,
}

/// Errors produced by [`SessionBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum SessionBuilderError {
	/// Issued when no access token value was provided.
	#[error("Access token is required.")]
	MissingAccessToken,
	/// Issued when no expiry (absolute or relative) was configured.
	#[error("Expiry must be supplied via expires_at or expires_in.")]
	MissingExpiry,
}

/// Signed-in session as persisted by the Token Store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
	/// Access token; callers must avoid logging it.
	pub access_token: AccessToken,
	/// Refresh token, if the backend issued one.
	pub refresh_token: Option<RefreshToken>,
	/// Signed-in customer, when known.
	pub subject: Option<CustomerId>,
	/// Instant the current access token was stored.
	pub issued_at: OffsetDateTime,
	/// Absolute expiry of the current access token.
	pub expires_at: OffsetDateTime,
}
impl Session {
	/// Returns a builder for a new session.
	pub fn builder() -> SessionBuilder {
		SessionBuilder::default()
	}

	/// Computes the lifecycle status at `instant` using `skew` as the safety margin.
	///
	/// A margin reaching past the earliest representable instant marks the token as expiring.
	pub fn status_at(&self, instant: OffsetDateTime, skew: Duration) -> SessionStatus {
		if instant >= self.expires_at {
			SessionStatus::Expired
		} else if self.expires_at.checked_sub(skew).is_none_or(|threshold| instant >= threshold) {
			SessionStatus::Expiring
		} else {
			SessionStatus::Active
		}
	}

	/// Returns `true` while the access token has not expired at `instant`.
	pub fn is_authenticated_at(&self, instant: OffsetDateTime) -> bool {
		instant < self.expires_at
	}

	/// Returns the access token only if it stays valid beyond `skew` at `instant`.
	pub fn usable_access_token_at(
		&self,
		instant: OffsetDateTime,
		skew: Duration,
	) -> Option<&AccessToken> {
		matches!(self.status_at(instant, skew), SessionStatus::Active).then_some(&self.access_token)
	}

	/// Produces the session that results from a successful refresh.
	///
	/// The subject is kept; the refresh token is kept unless the backend rotated it.
	pub fn refreshed(
		&self,
		access_token: AccessToken,
		expires_at: OffsetDateTime,
		rotated: Option<RefreshToken>,
		issued_at: OffsetDateTime,
	) -> Self {
		Self {
			access_token,
			refresh_token: rotated.or_else(|| self.refresh_token.clone()),
			subject: self.subject.clone(),
			issued_at,
			expires_at,
		}
	}
}
impl Debug for Session {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Session")
			.field("access_token", &"<redacted>")
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
			.field("subject", &self.subject)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Builder for [`Session`].
#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
	access_token: Option<AccessToken>,
	refresh_token: Option<RefreshToken>,
	subject: Option<CustomerId>,
	issued_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
}
impl SessionBuilder {
	/// Provides the access token value.
	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(AccessToken::new(token));

		self
	}

	/// Provides the refresh token value.
	pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
		self.refresh_token = Some(RefreshToken::new(token));

		self
	}

	/// Sets or clears the refresh token.
	pub fn maybe_refresh_token(mut self, token: Option<RefreshToken>) -> Self {
		self.refresh_token = token;

		self
	}

	/// Records the signed-in customer.
	pub fn subject(mut self, subject: CustomerId) -> Self {
		self.subject = Some(subject);

		self
	}

	/// Sets the issued-at instant; defaults to the current clock.
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry measured from the issued-at instant.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Consumes the builder and produces a [`Session`].
	pub fn build(self) -> Result<Session, SessionBuilderError> {
		let access_token = self.access_token.ok_or(SessionBuilderError::MissingAccessToken)?;
		let issued_at = self.issued_at.unwrap_or_else(OffsetDateTime::now_utc);
		let expires_at = match (self.expires_at, self.expires_in) {
			(Some(instant), _) => instant,
			(None, Some(delta)) => issued_at + delta,
			(None, None) => return Err(SessionBuilderError::MissingExpiry),
		};

		Ok(Session {
			access_token,
			refresh_token: self.refresh_token,
			subject: self.subject,
			issued_at,
			expires_at,
		})
	}
}
