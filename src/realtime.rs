//! Realtime Invalidation Channel.
//!
//! A long-lived connection delivers change notifications that are mapped onto cache groups and
//! published on an [`InvalidationBus`]. Reconnects follow exponential backoff up to a bounded
//! attempt count, after which the channel stops until explicitly reset. Without a realtime
//! endpoint, demo mode falls back to fixed-interval polling instead.

pub mod channel;
pub mod event;
pub mod invalidation;
pub mod state;
pub mod transport;

pub use channel::*;
pub use event::*;
pub use invalidation::*;
pub use state::*;
pub use transport::*;
