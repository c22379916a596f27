//! Service host contract and the name-keyed method registry.
//!
//! The engine hands every inbound request and event to a [`ServiceHost`]
//! in a detached task; [`MethodRegistry`] is the provided implementation,
//! mapping method names to typed handlers. Handler-level failures never
//! tear the connection down: they become error-record responses (requests)
//! or logged drops (events).

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ReceiveContext;
use crate::codec::MsgPackCodec;
use crate::message::{status, Error, Message};

/// Boxed future returned by dispatch methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Asynchronously dispatches inbound requests and events by method name.
///
/// Implementations must be cheap to call: the engine invokes these from
/// detached per-message tasks and awaits the returned future there.
pub trait ServiceHost: Send + Sync + 'static {
    /// Produce the response for an inbound request.
    fn dispatch_request(
        &self,
        method_name: &str,
        ctx: ReceiveContext,
        message: Message,
    ) -> BoxFuture<'static, Message>;

    /// Handle an inbound fire-and-forget event.
    fn dispatch_event(
        &self,
        method_name: &str,
        ctx: ReceiveContext,
        message: Message,
    ) -> BoxFuture<'static, ()>;
}

trait RequestHandler: Send + Sync {
    fn call(&self, payload: &[u8], ctx: ReceiveContext) -> BoxFuture<'static, Message>;
}

trait EventHandler: Send + Sync {
    fn call(&self, payload: &[u8], ctx: ReceiveContext) -> BoxFuture<'static, ()>;
}

/// Wrapper that deserializes the payload before calling a request handler
/// and serializes its result afterwards.
struct TypedRequestHandler<F, T, R, Fut>
where
    F: Fn(T, ReceiveContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> RequestHandler for TypedRequestHandler<F, T, R, Fut>
where
    F: Fn(T, ReceiveContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    fn call(&self, payload: &[u8], ctx: ReceiveContext) -> BoxFuture<'static, Message> {
        let parsed: T = match MsgPackCodec::decode(payload) {
            Ok(value) => value,
            Err(e) => {
                let error =
                    Error::internal_server_error(format!("request payload decoding: {e}"));
                return Box::pin(async move { Message::error(error) });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            match fut.await {
                Ok(result) => match MsgPackCodec::encode(&result) {
                    Ok(bytes) => Message::payload(bytes),
                    Err(e) => Message::error(Error::internal_server_error(format!(
                        "response encoding: {e}"
                    ))),
                },
                Err(error) => Message::error(error),
            }
        })
    }
}

struct TypedEventHandler<F, T, Fut>
where
    F: Fn(T, ReceiveContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> EventHandler for TypedEventHandler<F, T, Fut>
where
    F: Fn(T, ReceiveContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, payload: &[u8], ctx: ReceiveContext) -> BoxFuture<'static, ()> {
        let parsed: T = match MsgPackCodec::decode(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "dropping event with undecodable payload");
                return Box::pin(async {});
            }
        };
        Box::pin((self.handler)(parsed, ctx))
    }
}

/// Registry mapping method names to typed handlers.
///
/// Unknown methods and undecodable payloads are answered with error
/// records; the connection stays up.
#[derive(Default)]
pub struct MethodRegistry {
    requests: HashMap<String, Box<dyn RequestHandler>>,
    events: HashMap<String, Box<dyn EventHandler>>,
}

impl MethodRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler.
    ///
    /// The handler receives the deserialized payload and returns either a
    /// serializable result or an [`Error`] record that travels back as the
    /// response.
    pub fn on_request<F, T, R, Fut>(mut self, method_name: &str, handler: F) -> Self
    where
        F: Fn(T, ReceiveContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        self.requests.insert(
            method_name.to_string(),
            Box::new(TypedRequestHandler {
                handler,
                _phantom: PhantomData,
            }),
        );
        self
    }

    /// Register an event handler.
    pub fn on_event<F, T, Fut>(mut self, method_name: &str, handler: F) -> Self
    where
        F: Fn(T, ReceiveContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.events.insert(
            method_name.to_string(),
            Box::new(TypedEventHandler {
                handler,
                _phantom: PhantomData,
            }),
        );
        self
    }

    /// True when a request handler is registered under `method_name`.
    pub fn has_request(&self, method_name: &str) -> bool {
        self.requests.contains_key(method_name)
    }

    /// True when an event handler is registered under `method_name`.
    pub fn has_event(&self, method_name: &str) -> bool {
        self.events.contains_key(method_name)
    }
}

impl ServiceHost for MethodRegistry {
    fn dispatch_request(
        &self,
        method_name: &str,
        ctx: ReceiveContext,
        message: Message,
    ) -> BoxFuture<'static, Message> {
        let handler = match self.requests.get(method_name) {
            Some(handler) => handler,
            None => {
                let error = Error::new(
                    status::METHOD_NOT_FOUND,
                    format!("no handler for method {method_name:?}"),
                );
                return Box::pin(async move { Message::error(error) });
            }
        };

        match message {
            Message::Payload(payload) => handler.call(&payload, ctx),
            // An inbound error in request position was already screened by
            // the engine; answer it rather than crash a handler on it.
            Message::Error(error) => Box::pin(async move { Message::error(error) }),
        }
    }

    fn dispatch_event(
        &self,
        method_name: &str,
        ctx: ReceiveContext,
        message: Message,
    ) -> BoxFuture<'static, ()> {
        let handler = match self.events.get(method_name) {
            Some(handler) => handler,
            None => {
                tracing::warn!(method_name, "dropping event with no registered handler");
                return Box::pin(async {});
            }
        };

        match message {
            Message::Payload(payload) => handler.call(&payload, ctx),
            Message::Error(error) => {
                tracing::warn!(method_name, error = %error, "dropping error-bearing event");
                Box::pin(async {})
            }
        }
    }
}
