//! # epoxy-core
//!
//! Bidirectional framed binary RPC transport: request/response exchanges
//! and fire-and-forget events multiplexed over a single reliable byte
//! stream (conventionally TCP). Each peer runs the same state machine; the
//! only asymmetry is which side opened the channel.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): little-endian frames of typed, length-
//!   prefixed framelets; validated before any payload is trusted.
//! - **Classification** ([`protocol::classify`]): a pure verdict on each
//!   decoded frame.
//! - **Correlation** ([`correlator`]): outstanding requests keyed by
//!   conversation id, failed in bulk on disconnect.
//! - **Engine** ([`connection`]): handshake, steady-state multiplexing with
//!   one reader and mutex-serialized writes, detached dispatch, teardown
//!   with a single metrics emission.
//!
//! ## Example
//!
//! ```ignore
//! use epoxy_core::{codec::MsgPackCodec, ConnectionBuilder, Message, MethodRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> epoxy_core::Result<()> {
//!     let listener = epoxy_core::transport::EpoxyListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!
//!     tokio::spawn(async move {
//!         let service = MethodRegistry::new()
//!             .on_request("Echo", |text: String, _ctx| async move { Ok(text) });
//!         let server = listener
//!             .accept(ConnectionBuilder::new().service(service))
//!             .await
//!             .unwrap();
//!         server.start().await.unwrap();
//!     });
//!
//!     let client = epoxy_core::transport::connect(addr, ConnectionBuilder::new()).await?;
//!     client.start().await?;
//!
//!     let payload = MsgPackCodec::encode(&"hi".to_string())?;
//!     let reply = client
//!         .request_response("Echo", Message::payload(payload), &CancellationToken::new())
//!         .await?;
//!     println!("{reply:?}");
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod layer;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use connection::{
    ConnectedArgs, Connection, ConnectionBuilder, ConnectionConfig, ConnectionObserver,
    ConnectionRole, ConnectionState, DisconnectedArgs,
};
pub use error::{EpoxyError, Result};
pub use handler::{MethodRegistry, ReceiveContext, SendContext, ServiceHost};
pub use layer::{Layer, LayerStack, Layers};
pub use message::{Error, Message, PayloadType, ProtocolError, ProtocolErrorCode};
pub use metrics::{ConnectionMetrics, ConnectionShutdownReason, MetricsSink};
