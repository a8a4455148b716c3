//! Tower integration: apply a [`Dispatcher`] to every request of an inner service.
//!
//! A key function maps each request to its partition and optional [`CachePolicy`]; the inner
//! service's `call` then plays the role of the dispatched operation.
//!
//! ```rust
//! use tollgate::{CounterSink, DispatchKey, DispatchLayer, Dispatcher, TollgateConfig};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let dispatcher = Dispatcher::from_config(&TollgateConfig::default(), CounterSink::new())?;
//! let layer = DispatchLayer::new(dispatcher, |_: &u64| DispatchKey::uncached("balances"));
//! let svc = layer.layer(service_fn(|wallet: u64| async move {
//!     Ok::<_, std::io::Error>(wallet * 2)
//! }));
//! assert_eq!(svc.oneshot(21).await.unwrap(), 42);
//! # Ok::<_, tollgate::ConfigError>(())
//! # });
//! ```

use crate::dispatcher::{CachePolicy, Dispatcher};
use crate::error::DispatchError;
use crate::telemetry::MetricsSink;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Partition and cache placement for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchKey {
    pub partition: String,
    pub cache: Option<CachePolicy>,
}

impl DispatchKey {
    pub fn uncached(partition: impl Into<String>) -> Self {
        Self { partition: partition.into(), cache: None }
    }

    pub fn cached(partition: impl Into<String>, policy: CachePolicy) -> Self {
        Self { partition: partition.into(), cache: Some(policy) }
    }
}

/// A layer that routes requests through a [`Dispatcher`].
pub struct DispatchLayer<M, K> {
    dispatcher: Dispatcher<M>,
    key_fn: Arc<K>,
}

impl<M: Clone, K> Clone for DispatchLayer<M, K> {
    fn clone(&self) -> Self {
        Self { dispatcher: self.dispatcher.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<M, K> DispatchLayer<M, K> {
    pub fn new(dispatcher: Dispatcher<M>, key_fn: K) -> Self {
        Self { dispatcher, key_fn: Arc::new(key_fn) }
    }
}

impl<M, K> fmt::Debug for DispatchLayer<M, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchLayer").field("dispatcher", &self.dispatcher).finish()
    }
}

impl<S, M: Clone, K> Layer<S> for DispatchLayer<M, K> {
    type Service = DispatchService<S, M, K>;

    fn layer(&self, service: S) -> Self::Service {
        DispatchService {
            inner: service,
            dispatcher: self.dispatcher.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service produced by [`DispatchLayer`].
pub struct DispatchService<S, M, K> {
    inner: S,
    dispatcher: Dispatcher<M>,
    key_fn: Arc<K>,
}

impl<S: Clone, M: Clone, K> Clone for DispatchService<S, M, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dispatcher: self.dispatcher.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S: fmt::Debug, M, K> fmt::Debug for DispatchService<S, M, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchService")
            .field("inner", &self.inner)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl<S, M, K, Req> Service<Req> for DispatchService<S, M, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Clone + Send + Sync + 'static,
    S::Error: Send + 'static,
    M: MetricsSink + Sync,
    M::Future: Send + 'static,
    K: Fn(&Req) -> DispatchKey + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = DispatchError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(DispatchError::Upstream)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let DispatchKey { partition, cache } = (self.key_fn)(&req);
        let dispatcher = self.dispatcher.clone();
        // Keep the instance that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            dispatcher.dispatch_with(&partition, cache, move || inner.call(req)).await
        })
    }
}
