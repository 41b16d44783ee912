//! Middleware pipeline.
//!
//! A pipeline is an immutable list of middlewares ending in a resolver. Each
//! middleware receives the context so far and a [`Next`] it may call with a
//! patch. The patch is merged under the upstream context (existing keys win)
//! before the rest of the chain runs.
//!
//! Resolver errors are classified and come back as `NextOutput::result`. An
//! `Err` returned by a middleware itself aborts the chain and reaches the
//! caller of [`Pipeline::run`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::runtime::ContextBuilder;
use crate::domain::{BoxError, Context, Data, Envelope, RpcError, classify};
use crate::ports::{Delivery, Message};
use crate::typed::{Request, Resolver};

/// Tagged result of a chain, with the context in effect where it ended.
#[derive(Debug, Clone)]
pub struct NextOutput {
    pub ctx: Context,
    pub result: Result<Data, RpcError>,
}

impl NextOutput {
    pub fn ok(ctx: Context, output: Data) -> Self {
        Self {
            ctx,
            result: Ok(output),
        }
    }

    pub fn error(ctx: Context, error: RpcError) -> Self {
        Self {
            ctx,
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<NextOutput, BoxError>;
}

/// Middleware from a closure returning a boxed future.
///
/// ```ignore
/// let tag = middleware_fn(|_ctx, next| {
///     Box::pin(async move { next.run(Some(Context::new().with("tagged", true))).await })
/// });
/// ```
pub struct FnMiddleware<F>(F);

pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(Context, Next<'a>) -> BoxFuture<'a, Result<NextOutput, BoxError>> + Send + Sync,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(Context, Next<'a>) -> BoxFuture<'a, Result<NextOutput, BoxError>> + Send + Sync,
{
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<NextOutput, BoxError> {
        (self.0)(ctx, next).await
    }
}

#[derive(Clone, Copy)]
struct Chain<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    resolver: &'a dyn Resolver,
    envelope: &'a Envelope<Data>,
    message: &'a Message,
    delivery: Option<&'a Delivery>,
}

/// The rest of the chain, handed to a middleware.
pub struct Next<'a> {
    upstream: Context,
    chain: Chain<'a>,
}

impl<'a> Next<'a> {
    /// Context this middleware was called with.
    pub fn context(&self) -> &Context {
        &self.upstream
    }

    pub fn envelope(&self) -> &Envelope<Data> {
        self.chain.envelope
    }

    pub fn message(&self) -> &Message {
        self.chain.message
    }

    /// Run the rest of the chain, adding the keys of `patch` that the
    /// upstream context does not have yet.
    pub async fn run(self, patch: Option<Context>) -> Result<NextOutput, BoxError> {
        let ctx = match patch {
            Some(patch) => self.upstream.merge_defaults(patch),
            None => self.upstream,
        };
        resolve(ctx, self.chain).await
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("upstream", &self.upstream)
            .field("remaining", &self.chain.remaining.len())
            .finish()
    }
}

fn resolve<'a>(ctx: Context, chain: Chain<'a>) -> BoxFuture<'a, Result<NextOutput, BoxError>> {
    Box::pin(async move {
        match chain.remaining.split_first() {
            None => {
                let request = Request {
                    ctx: ctx.clone(),
                    envelope: chain.envelope.clone(),
                    message: chain.message.clone(),
                    delivery: chain.delivery.cloned(),
                };
                match chain.resolver.resolve(request).await {
                    Ok(output) => Ok(NextOutput::ok(ctx, output)),
                    Err(error) => Ok(NextOutput::error(ctx, classify(error))),
                }
            }
            Some((head, tail)) => {
                let next = Next {
                    upstream: ctx.clone(),
                    chain: Chain {
                        remaining: tail,
                        ..chain
                    },
                };
                head.handle(ctx, next).await
            }
        }
    })
}

/// Ordered middlewares shared by procedures built from the same builder.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// New pipeline with `middleware` appended. `self` is unchanged.
    pub fn with(&self, middleware: impl Middleware + 'static) -> Pipeline {
        self.with_arc(Arc::new(middleware))
    }

    pub fn with_arc(&self, middleware: Arc<dyn Middleware>) -> Pipeline {
        let mut middlewares = self.middlewares.clone();
        middlewares.push(middleware);
        Pipeline { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Build the base context and run the chain for one message.
    pub async fn run(
        &self,
        context_builder: &dyn ContextBuilder,
        message: &Message,
        envelope: &Envelope<Data>,
        delivery: Option<&Delivery>,
        resolver: &dyn Resolver,
    ) -> Result<NextOutput, RpcError> {
        let base = context_builder
            .build(message, envelope)
            .await
            .map_err(classify)?;
        let chain = Chain {
            remaining: &self.middlewares,
            resolver,
            envelope,
            message,
            delivery,
        };
        resolve(base, chain).await.map_err(classify)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::runtime::{EmptyContext, context_fn};
    use crate::domain::ErrorKind;
    use crate::test_support::envelope;
    use crate::typed::resolver_fn;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Patch(Context);

    #[async_trait]
    impl Middleware for Patch {
        async fn handle(&self, _ctx: Context, next: Next<'_>) -> Result<NextOutput, BoxError> {
            next.run(Some(self.0.clone())).await
        }
    }

    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        async fn handle(&self, _ctx: Context, _next: Next<'_>) -> Result<NextOutput, BoxError> {
            Err(RpcError::new(ErrorKind::InvalidRequest, "rejected by middleware").into())
        }
    }

    fn capture_ctx(seen: Arc<Mutex<Option<Context>>>) -> impl Resolver {
        resolver_fn(move |req: Request| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock().unwrap() = Some(req.ctx.clone());
                Ok::<_, BoxError>(Data::Json(json!("done")))
            }
        })
    }

    fn message() -> Message {
        Message::new("svc.op", b"null".to_vec())
    }

    #[tokio::test]
    async fn patch_merge_is_left_biased() {
        let seen = Arc::new(Mutex::new(None));
        let resolver = capture_ctx(Arc::clone(&seen));
        let base = context_fn(|_: &Message, _: &Envelope<Data>| Context::new().with("a", 1));
        let pipeline =
            Pipeline::new().with(Patch(Context::new().with("a", 2).with("b", 3)));

        let out = pipeline
            .run(&base, &message(), &envelope(Data::null()), None, &resolver)
            .await
            .unwrap();

        let expected = Context::new().with("a", 1).with("b", 3);
        assert_eq!(seen.lock().unwrap().clone(), Some(expected.clone()));
        assert_eq!(out.ctx, expected);
        assert_eq!(out.result.unwrap(), Data::Json(json!("done")));
    }

    #[tokio::test]
    async fn patches_accumulate_in_order() {
        let seen = Arc::new(Mutex::new(None));
        let resolver = capture_ctx(Arc::clone(&seen));
        let pipeline = Pipeline::new()
            .with(Patch(Context::new().with("first", true).with("shared", "outer")))
            .with(Patch(Context::new().with("second", true).with("shared", "inner")));

        pipeline
            .run(&EmptyContext, &message(), &envelope(Data::null()), None, &resolver)
            .await
            .unwrap();

        let ctx = seen.lock().unwrap().clone().unwrap();
        assert_eq!(ctx.get("shared"), Some(&Value::from("outer")));
        assert_eq!(ctx.get("first"), Some(&Value::from(true)));
        assert_eq!(ctx.get("second"), Some(&Value::from(true)));
    }

    #[tokio::test]
    async fn resolver_errors_are_classified_into_the_tagged_result() {
        let failing = resolver_fn(|_req: Request| async move {
            Err::<Data, BoxError>(std::io::Error::other("db down").into())
        });
        let out = Pipeline::new()
            .run(&EmptyContext, &message(), &envelope(Data::null()), None, &failing)
            .await
            .unwrap();
        let err = out.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(err.cause().is_some());

        let typed = resolver_fn(|_req: Request| async move {
            Err::<Data, BoxError>(RpcError::invalid_data("nope").into())
        });
        let out = Pipeline::new()
            .run(&EmptyContext, &message(), &envelope(Data::null()), None, &typed)
            .await
            .unwrap();
        assert_eq!(out.result.unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn middleware_raise_aborts_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resolver = resolver_fn(move |_req: Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(Data::null()) }
        });
        let pipeline = Pipeline::new().with(Reject);

        let err = pipeline
            .run(&EmptyContext, &message(), &envelope(Data::null()), None, &resolver)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn adding_a_middleware_leaves_the_original_untouched() {
        let base = Pipeline::new().with(Patch(Context::new()));
        let extended = base.with(Reject);
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
    }

    #[tokio::test]
    async fn closure_middleware_can_patch() {
        let seen = Arc::new(Mutex::new(None));
        let resolver = capture_ctx(Arc::clone(&seen));
        let tag = middleware_fn(|_ctx, next| {
            Box::pin(async move { next.run(Some(Context::new().with("tagged", true))).await })
        });

        Pipeline::new()
            .with(tag)
            .run(&EmptyContext, &message(), &envelope(Data::null()), None, &resolver)
            .await
            .unwrap();
        let ctx = seen.lock().unwrap().clone().unwrap();
        assert_eq!(ctx.get("tagged"), Some(&Value::from(true)));
    }
}
