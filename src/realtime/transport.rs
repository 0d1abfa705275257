//! Connection seam for the realtime channel, plus the websocket implementation.
//!
//! The channel only needs two things from a connection: the next text frame (or `None` once
//! the peer closed) and a way to close it. Anything else (pings, binary frames) is the
//! transport's business.

// self
use crate::_prelude::*;

/// Boxed future resolving to an open connection.
pub type ConnectFuture<'a> =
	Pin<Box<dyn Future<Output = Result<Box<dyn RealtimeConnection>, RealtimeError>> + 'a + Send>>;
/// Boxed future resolving to the next text frame, or `None` once the connection closed.
pub type MessageFuture<'a> =
	Pin<Box<dyn Future<Output = Option<Result<String, RealtimeError>>> + 'a + Send>>;
/// Boxed future completing once the connection is closed.
pub type CloseFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a + Send>>;

/// Failures inside the realtime channel. They drive the state machine and never reach callers.
#[derive(Debug, ThisError)]
pub enum RealtimeError {
	/// The connection could not be opened.
	#[error("Realtime connection could not be opened: {message}.")]
	Connect {
		/// Summary of the underlying failure.
		message: String,
	},
	/// The open connection failed.
	#[error("Realtime connection failed: {message}.")]
	Protocol {
		/// Summary of the underlying failure.
		message: String,
	},
	/// A frame was not a structured event.
	#[error("Realtime message is malformed.")]
	Malformed(#[source] serde_json::Error),
}

/// Opens realtime connections.
pub trait RealtimeTransport
where
	Self: 'static + Send + Sync,
{
	/// Connects to `url`.
	fn connect<'a>(&'a self, url: &'a Url) -> ConnectFuture<'a>;
}

/// One open realtime connection.
pub trait RealtimeConnection
where
	Self: Send,
{
	/// Waits for the next text frame.
	fn next_message(&mut self) -> MessageFuture<'_>;

	/// Closes the connection. Closing twice is harmless.
	fn close(&mut self) -> CloseFuture<'_>;
}

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
#[cfg(feature = "websocket")]
mod websocket {
	// crates.io
	use futures_util::StreamExt;
	use tokio::net::TcpStream;
	use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
	// self
	use super::*;

	/// [`RealtimeTransport`] over websockets (`ws://` and `wss://`).
	#[derive(Clone, Copy, Debug, Default)]
	pub struct WebSocketTransport;
	impl RealtimeTransport for WebSocketTransport {
		fn connect<'a>(&'a self, url: &'a Url) -> ConnectFuture<'a> {
			Box::pin(async move {
				let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
					.await
					.map_err(|e| RealtimeError::Connect { message: e.to_string() })?;

				Ok(Box::new(WebSocketConnection(stream)) as Box<dyn RealtimeConnection>)
			})
		}
	}

	struct WebSocketConnection(WebSocketStream<MaybeTlsStream<TcpStream>>);
	impl RealtimeConnection for WebSocketConnection {
		fn next_message(&mut self) -> MessageFuture<'_> {
			Box::pin(async move {
				loop {
					match self.0.next().await? {
						Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
						Ok(Message::Close(_)) => return None,
						Ok(_) => continue,
						Err(e) => return Some(Err(RealtimeError::Protocol { message: e.to_string() })),
					}
				}
			})
		}

		fn close(&mut self) -> CloseFuture<'_> {
			Box::pin(async move {
				let _ = self.0.close(None).await;
			})
		}
	}
}
