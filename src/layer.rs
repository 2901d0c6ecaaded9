//! Tower integration.
//!
//! [`RaterLayer`] puts a [`Rater`] in front of any service. The subject key is pulled from
//! each request by a caller-supplied closure; the wrapped service is only called when the
//! rater lets the event through.
//!
//! ```
//! use rater::{NoopNotifier, Outcome, Rater, RaterConfig, RaterLayer};
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, Service, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let rater: Rater<u64> = Rater::new(RaterConfig::default());
//! let layer = RaterLayer::new(rater, Arc::new(NoopNotifier), |user: &u64| *user);
//! let mut svc = layer.layer(service_fn(|user: u64| async move { Ok::<_, Infallible>(user) }));
//!
//! let outcome = svc.ready().await.unwrap().call(5).await.unwrap();
//! assert_eq!(outcome, Outcome::Proceeded(5));
//! # }
//! ```

use crate::cache::CacheKey;
use crate::error::RaterError;
use crate::rater::{Outcome, Rater, SharedNotifier};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Wraps services with a [`Rater`].
pub struct RaterLayer<K, X> {
    rater: Rater<K>,
    notifier: SharedNotifier<K>,
    extract: Arc<X>,
}

impl<K, X> RaterLayer<K, X> {
    /// `extract` maps a request to its subject key.
    pub fn new(rater: Rater<K>, notifier: SharedNotifier<K>, extract: X) -> Self {
        Self { rater, notifier, extract: Arc::new(extract) }
    }
}

impl<K, X> Clone for RaterLayer<K, X> {
    fn clone(&self) -> Self {
        Self {
            rater: self.rater.clone(),
            notifier: self.notifier.clone(),
            extract: self.extract.clone(),
        }
    }
}

impl<K, X> fmt::Debug for RaterLayer<K, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaterLayer").field("rater", &self.rater).finish()
    }
}

impl<S, K, X> Layer<S> for RaterLayer<K, X> {
    type Service = RaterService<S, K, X>;

    fn layer(&self, service: S) -> Self::Service {
        RaterService {
            inner: service,
            rater: self.rater.clone(),
            notifier: self.notifier.clone(),
            extract: self.extract.clone(),
        }
    }
}

/// Service produced by [`RaterLayer`].
pub struct RaterService<S, K, X> {
    inner: S,
    rater: Rater<K>,
    notifier: SharedNotifier<K>,
    extract: Arc<X>,
}

impl<S: Clone, K, X> Clone for RaterService<S, K, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rater: self.rater.clone(),
            notifier: self.notifier.clone(),
            extract: self.extract.clone(),
        }
    }
}

impl<S: fmt::Debug, K, X> fmt::Debug for RaterService<S, K, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaterService")
            .field("inner", &self.inner)
            .field("rater", &self.rater)
            .finish()
    }
}

impl<S, K, X, Req> Service<Req> for RaterService<S, K, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    K: CacheKey,
    X: Fn(&Req) -> K + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Outcome<S::Response>;
    type Error = RaterError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RaterError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.extract)(&req);
        let rater = self.rater.clone();
        let notifier = self.notifier.clone();
        // Keep the instance that was driven to readiness for this call.
        let fresh = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, fresh);

        Box::pin(async move { rater.handle_event(key, &notifier, move || inner.call(req)).await })
    }
}
