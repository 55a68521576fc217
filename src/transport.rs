//! Transport abstraction for the IM session.
//!
//! The [`Transport`] trait is a bidirectional [`Frame`] channel to the IM
//! backend. The [`Connector`] trait is the single connect primitive the
//! session uses to open one: it makes exactly one attempt and never retries.
//! Every retry and backoff decision belongs to
//! [`ReconnectStrategy`](crate::strategy::ReconnectStrategy).
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use imlink::error::ImError;
//! use imlink::protocol::Frame;
//! use imlink::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: Frame) -> Result<(), ImError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<Frame, ImError>> {
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), ImError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ImError> {
//!         Ok(Box::new(MyTransport { /* ... */ }))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::ImError;
use crate::protocol::Frame;

/// A bidirectional frame transport to the IM backend.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: the socket link polls it
/// inside `tokio::select!` next to its outbound queue.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`ImError::TransportSend`] or [`ImError::TransportClosed`] if
    /// the frame could not be written.
    async fn send(&mut self, frame: Frame) -> Result<(), ImError>;

    /// Receive the next frame.
    ///
    /// Returns:
    /// - `Some(Ok(Frame::Close { .. }))`: the peer sent a close frame
    /// - `Some(Ok(frame))`: a data frame
    /// - `Some(Err(e))`: a transport error
    /// - `None`: the stream ended without a close frame
    async fn recv(&mut self) -> Option<Result<Frame, ImError>>;

    /// Close the connection gracefully. Must be idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails; resources are released
    /// regardless.
    async fn close(&mut self) -> Result<(), ImError>;
}

/// Opens a [`Transport`] to a fully built endpoint URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Make a single connection attempt.
    ///
    /// # Errors
    ///
    /// Any error that prevents the connection from opening.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ImError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, frame: Frame) -> Result<(), ImError> {
        (**self).send(frame).await
    }

    async fn recv(&mut self) -> Option<Result<Frame, ImError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), ImError> {
        (**self).close().await
    }
}
