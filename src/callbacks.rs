//! The two callback capabilities the Manager invokes: closing a connection
//! (trimmer) and attempting a redial (jitter controller). Both are
//! polymorphic per the Design Notes ("Dynamic dispatch"); `async_trait`
//! keeps them object-safe so the Manager can hold `Arc<dyn ...>`.

use async_trait::async_trait;
use libp2p::PeerId;

use crate::error::ConnMgrError;

/// Invoked by the trimmer to actually close a connection. The peer is
/// removed from the pool only if this returns `Ok`.
#[async_trait]
pub trait CloseCallback: Send + Sync {
    async fn close(&self, peer_id: PeerId) -> Result<(), ConnMgrError>;
}

/// Invoked by the jitter controller to attempt a redial after a disconnect.
#[async_trait]
pub trait ReconnectCallback: Send + Sync {
    async fn reconnect(&self, peer_id: PeerId) -> Result<(), ConnMgrError>;
}

struct FnCloseCallback<F>(F);

#[async_trait]
impl<F, Fut> CloseCallback for FnCloseCallback<F>
where
    F: Fn(PeerId) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ConnMgrError>> + Send,
{
    async fn close(&self, peer_id: PeerId) -> Result<(), ConnMgrError> {
        (self.0)(peer_id).await
    }
}

/// Wraps a plain async closure as a [`CloseCallback`] trait object.
pub fn close_callback_fn<F, Fut>(f: F) -> std::sync::Arc<dyn CloseCallback>
where
    F: Fn(PeerId) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ConnMgrError>> + Send + 'static,
{
    std::sync::Arc::new(FnCloseCallback(f))
}

struct FnReconnectCallback<F>(F);

#[async_trait]
impl<F, Fut> ReconnectCallback for FnReconnectCallback<F>
where
    F: Fn(PeerId) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ConnMgrError>> + Send,
{
    async fn reconnect(&self, peer_id: PeerId) -> Result<(), ConnMgrError> {
        (self.0)(peer_id).await
    }
}

/// Wraps a plain async closure as a [`ReconnectCallback`] trait object.
pub fn reconnect_callback_fn<F, Fut>(f: F) -> std::sync::Arc<dyn ReconnectCallback>
where
    F: Fn(PeerId) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ConnMgrError>> + Send + 'static,
{
    std::sync::Arc::new(FnReconnectCallback(f))
}
