//! Auth-domain identifiers, redacted token secrets, and the session record.

pub mod id;
pub mod secret;
pub mod session;

pub use id::*;
pub use secret::*;
pub use session::*;
