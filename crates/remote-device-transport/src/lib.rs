//! Observer-facing transport.
//!
//! Provides:
//! - Wire protocol (JSON, `type`-tagged)
//! - WebSocket channel subscriptions and requests (feature: server)
//! - HTTP API routes (feature: server)

pub mod protocol;

#[cfg(feature = "server")]
pub mod routes;
#[cfg(feature = "server")]
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};
#[cfg(feature = "server")]
pub use routes::{ApiError, router};

#[cfg(test)]
mod test_support {
    use async_trait::async_trait;
    use remote_device_core::{DeviceTransport, SessionHandle, TransportError};

    /// A device that is never reachable.
    pub struct OfflineTransport;

    #[async_trait]
    impl DeviceTransport for OfflineTransport {
        async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError> {
            Err(TransportError::Connect(format!("unable to connect to {address}")))
        }

        async fn disconnect(&self, _handle: &SessionHandle) {}

        async fn execute(
            &self,
            _handle: &SessionHandle,
            _command: &str,
        ) -> Result<String, TransportError> {
            Err(TransportError::Execute("device offline".into()))
        }
    }
}
