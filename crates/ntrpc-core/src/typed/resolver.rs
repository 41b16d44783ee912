//! Resolver - the application function at the end of a pipeline.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::domain::{BoxError, Context, Data, Envelope, RpcError};
use crate::ports::{Acker, Delivery, Message};

/// Everything a resolver sees for one message.
#[derive(Clone)]
pub struct Request {
    /// Context after every middleware patch.
    pub ctx: Context,
    pub envelope: Envelope<Data>,
    pub message: Message,
    /// Queue only: the delivery being processed.
    pub delivery: Option<Delivery>,
}

impl Request {
    pub fn input(&self) -> &Data {
        &self.envelope.data
    }

    /// Deserialize the JSON input. Mismatches are `INVALID_DATA`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.envelope.data.decode_json()
    }

    /// Acknowledgement handle of a Queue delivery. Only useful when the
    /// procedure runs with `auto_ack` disabled.
    pub fn acker(&self) -> Option<Arc<dyn Acker>> {
        self.delivery.as_ref().map(Delivery::acker)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("ctx", &self.ctx)
            .field("envelope", &self.envelope)
            .field("delivery", &self.delivery.as_ref().map(|d| &d.info))
            .finish()
    }
}

/// Untyped resolver. Errors are classified by the pipeline: an `RpcError`
/// passes through, anything else becomes `INTERNAL_ERROR`.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, request: Request) -> Result<Data, BoxError>;
}

/// Resolver from an async closure.
pub struct FnResolver<F>(F);

/// ```ignore
/// let echo = resolver_fn(|req: Request| async move { Ok(req.envelope.data) });
/// ```
pub fn resolver_fn<F, Fut>(f: F) -> FnResolver<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Data, BoxError>> + Send + 'static,
{
    FnResolver(f)
}

#[async_trait]
impl<F, Fut> Resolver for FnResolver<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Data, BoxError>> + Send + 'static,
{
    async fn resolve(&self, request: Request) -> Result<Data, BoxError> {
        (self.0)(request).await
    }
}
