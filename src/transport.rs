//! Transport abstractions and broker publishers.
//!
//! This module defines a Tower-compatible transport used by the scheduler to
//! hand a taken [`OutboxMessage`] to a broker.
//!
//! A call resolves to `true` when the broker confirmed receipt and `false` on
//! a clean negative confirmation. Anything else (connection failures,
//! confirmation timeouts) is a [`TransportError`]. The scheduler treats both
//! `false` and errors as "not delivered".
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper around a layered `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete publishers
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt};
use tracing_error::SpanTrace;

use crate::OutboxMessage;

pub use inmemory::{InMemory, Outcome};

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the entry point for publishing. It wraps an underlying
/// Tower `Service` stack and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`publish`](Transport::publish) API
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Publish one message and report whether the broker confirmed it.
    pub async fn publish(&mut self, message: OutboxMessage) -> Result<bool, TransportError>
    where
        S: Service<OutboxMessage, Response = bool> + Send,
        S::Future: Send,
        S::Error: Into<tower::BoxError>,
    {
        let service = ServiceExt::<OutboxMessage>::ready(&mut self.service)
            .await
            .map_err(|e| TransportError::not_ready(e.into()))?;

        service
            .call(message)
            .await
            .map_err(|e| TransportError::sender(e.into()))
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The service refused to become ready.
    NotReady(tower::BoxError),
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
}

impl TransportError {
    /// Create a readiness-related transport error.
    pub fn not_ready(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::NotReady(err),
        }
    }

    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::NotReady(err) => writeln!(f, "Transport not ready: {err}"),
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::NotReady(err) => Some(err.as_ref()),
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<OutboxMessage> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = bool;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<bool, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: OutboxMessage) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move { sender.send(req).await.map_err(Into::into) })
    }
}

/// Trait implemented by concrete publishers.
///
/// A sender delivers one [`OutboxMessage`] to an external system and waits
/// for that system to confirm or reject it.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish the message; `Ok(true)` means the broker confirmed receipt.
    async fn send(&mut self, message: OutboxMessage) -> Result<bool, Self::Error>;
}
