//! Layer stack.
//!
//! An ordered pipeline of user transforms applied on send and receive. The
//! connection engine treats the whole stack as two opaque hooks: `on_send`
//! may produce a side-data blob that travels in the `LayerData` framelet,
//! and `on_receive` consumes it on the far side. A returned error
//! short-circuits per message type (see the engine) but never tears the
//! connection down.

use serde_bytes::ByteBuf;

use crate::codec::MsgPackCodec;
use crate::handler::{ReceiveContext, SendContext};
use crate::message::{Error, PayloadType};

/// The stack-level contract the engine invokes.
pub trait LayerStack: Send + Sync + 'static {
    /// Called before a message is framed. `Ok(Some(blob))` attaches a
    /// `LayerData` framelet; `Err` short-circuits the send.
    fn on_send(
        &self,
        message_type: PayloadType,
        ctx: &SendContext,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// Called after a message is classified, with the peer's blob when one
    /// was attached. `Err` replaces or drops the inbound message.
    fn on_receive(
        &self,
        message_type: PayloadType,
        ctx: &ReceiveContext,
        layer_data: Option<&[u8]>,
    ) -> Result<(), Error>;
}

/// A single layer in a [`Layers`] chain.
///
/// Each layer owns its own blob; [`Layers`] packs them into one
/// `LayerData` framelet.
pub trait Layer: Send + Sync + 'static {
    /// Per-layer send hook.
    fn on_send(
        &self,
        message_type: PayloadType,
        ctx: &SendContext,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// Per-layer receive hook.
    fn on_receive(
        &self,
        message_type: PayloadType,
        ctx: &ReceiveContext,
        layer_data: Option<&[u8]>,
    ) -> Result<(), Error>;
}

/// Chains individual [`Layer`]s into one [`LayerStack`].
///
/// Send runs layers in registration order and packs each layer's blob into
/// a MsgPack list; receive unpacks the list and runs the layers in reverse
/// order. The first error wins.
#[derive(Default)]
pub struct Layers {
    layers: Vec<Box<dyn Layer>>,
}

impl Layers {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer; send order is append order.
    pub fn push(mut self, layer: impl Layer) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Number of layers in the chain.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when no layers are registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl LayerStack for Layers {
    fn on_send(
        &self,
        message_type: PayloadType,
        ctx: &SendContext,
    ) -> Result<Option<Vec<u8>>, Error> {
        if self.layers.is_empty() {
            return Ok(None);
        }

        let mut blobs: Vec<Option<ByteBuf>> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            blobs.push(layer.on_send(message_type, ctx)?.map(ByteBuf::from));
        }
        if blobs.iter().all(Option::is_none) {
            return Ok(None);
        }

        let packed = MsgPackCodec::encode(&blobs)
            .map_err(|e| Error::internal_server_error(format!("layer data encoding: {e}")))?;
        Ok(Some(packed))
    }

    fn on_receive(
        &self,
        message_type: PayloadType,
        ctx: &ReceiveContext,
        layer_data: Option<&[u8]>,
    ) -> Result<(), Error> {
        if self.layers.is_empty() {
            return Ok(());
        }

        let blobs: Vec<Option<ByteBuf>> = match layer_data {
            Some(bytes) => MsgPackCodec::decode(bytes)
                .map_err(|e| Error::internal_server_error(format!("layer data decoding: {e}")))?,
            None => vec![None; self.layers.len()],
        };

        // Receive runs the chain in reverse, pairing each layer with the
        // blob its peer counterpart produced.
        for (layer, blob) in self.layers.iter().zip(blobs.iter()).rev() {
            layer.on_receive(message_type, ctx, blob.as_ref().map(|v| v.as_slice()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ConnectionMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn send_ctx() -> SendContext {
        SendContext {
            conversation_id: 1,
            connection_id: "test".into(),
        }
    }

    fn receive_ctx() -> ReceiveContext {
        ReceiveContext {
            conversation_id: 1,
            metrics: ConnectionMetrics::new("l".into(), "r".into()),
        }
    }

    struct TagLayer {
        tag: &'static [u8],
        receive_order: Arc<AtomicUsize>,
        observed_at: Arc<AtomicUsize>,
    }

    impl Layer for TagLayer {
        fn on_send(&self, _: PayloadType, _: &SendContext) -> Result<Option<Vec<u8>>, Error> {
            Ok(Some(self.tag.to_vec()))
        }

        fn on_receive(
            &self,
            _: PayloadType,
            _: &ReceiveContext,
            layer_data: Option<&[u8]>,
        ) -> Result<(), Error> {
            assert_eq!(layer_data, Some(self.tag));
            self.observed_at
                .store(self.receive_order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_empty_stack_is_transparent() {
        let layers = Layers::new();
        assert!(layers
            .on_send(PayloadType::Request, &send_ctx())
            .unwrap()
            .is_none());
        layers
            .on_receive(PayloadType::Request, &receive_ctx(), None)
            .unwrap();
    }

    #[test]
    fn test_blobs_roundtrip_and_reverse_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let first_at = Arc::new(AtomicUsize::new(usize::MAX));
        let second_at = Arc::new(AtomicUsize::new(usize::MAX));

        let layers = Layers::new()
            .push(TagLayer {
                tag: b"first",
                receive_order: order.clone(),
                observed_at: first_at.clone(),
            })
            .push(TagLayer {
                tag: b"second",
                receive_order: order.clone(),
                observed_at: second_at.clone(),
            });

        let blob = layers
            .on_send(PayloadType::Request, &send_ctx())
            .unwrap()
            .expect("layers produced data");

        layers
            .on_receive(PayloadType::Request, &receive_ctx(), Some(&blob))
            .unwrap();

        // Reverse order on receive: "second" observed before "first".
        assert_eq!(second_at.load(Ordering::SeqCst), 0);
        assert_eq!(first_at.load(Ordering::SeqCst), 1);
    }

    struct RejectLayer;

    impl Layer for RejectLayer {
        fn on_send(&self, _: PayloadType, _: &SendContext) -> Result<Option<Vec<u8>>, Error> {
            Err(Error::new(7, "rejected on send"))
        }

        fn on_receive(
            &self,
            _: PayloadType,
            _: &ReceiveContext,
            _: Option<&[u8]>,
        ) -> Result<(), Error> {
            Err(Error::new(8, "rejected on receive"))
        }
    }

    #[test]
    fn test_layer_error_short_circuits() {
        let layers = Layers::new().push(RejectLayer);

        let send_err = layers
            .on_send(PayloadType::Request, &send_ctx())
            .unwrap_err();
        assert_eq!(send_err.error_code, 7);

        let recv_err = layers
            .on_receive(PayloadType::Response, &receive_ctx(), None)
            .unwrap_err();
        assert_eq!(recv_err.error_code, 8);
    }

    struct SilentLayer;

    impl Layer for SilentLayer {
        fn on_send(&self, _: PayloadType, _: &SendContext) -> Result<Option<Vec<u8>>, Error> {
            Ok(None)
        }

        fn on_receive(
            &self,
            _: PayloadType,
            _: &ReceiveContext,
            layer_data: Option<&[u8]>,
        ) -> Result<(), Error> {
            assert!(layer_data.is_none());
            Ok(())
        }
    }

    #[test]
    fn test_all_silent_layers_emit_no_blob() {
        let layers = Layers::new().push(SilentLayer).push(SilentLayer);
        assert!(layers
            .on_send(PayloadType::Event, &send_ctx())
            .unwrap()
            .is_none());
        layers
            .on_receive(PayloadType::Event, &receive_ctx(), None)
            .unwrap();
    }
}
