//! Handler trait - 型付き入出力の resolver
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<I>`)
//! - Type erasure (`TypedResolver<I, H>` → `dyn Resolver`)
//!
//! JSON の入力は `I` に deserialize され、`Handler::Output` は JSON として返る。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::resolver::{Request, Resolver};
use crate::domain::{BoxError, Context, Data};

/// # 使用例
/// ```ignore
/// struct Add;
///
/// #[async_trait]
/// impl Handler<AddInput> for Add {
///     type Output = AddOutput;
///
///     async fn handle(&self, _ctx: Context, input: AddInput) -> Result<AddOutput, BoxError> {
///         Ok(AddOutput { sum: input.a + input.b })
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<I>: Send + Sync
where
    I: DeserializeOwned + Send + 'static,
{
    type Output: Serialize + Send + 'static;

    async fn handle(&self, ctx: Context, input: I) -> Result<Self::Output, BoxError>;
}

/// Adapts a `Handler<I>` to the untyped `Resolver` seam.
pub struct TypedResolver<I, H> {
    handler: H,
    _marker: PhantomData<fn() -> I>,
}

impl<I, H> TypedResolver<I, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, H> Resolver for TypedResolver<I, H>
where
    I: DeserializeOwned + Send + 'static,
    H: Handler<I>,
{
    async fn resolve(&self, request: Request) -> Result<Data, BoxError> {
        let input: I = request.json()?;
        let output = self.handler.handle(request.ctx, input).await?;
        Ok(Data::json(&output)?)
    }
}

/// Handler from an async closure `(Context, I) -> Result<O, BoxError>`.
pub struct FnHandler<F, O> {
    f: F,
    _output: PhantomData<fn() -> O>,
}

pub fn handler_fn<I, O, F, Fut>(f: F) -> FnHandler<F, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
{
    FnHandler {
        f,
        _output: PhantomData,
    }
}

#[async_trait]
impl<I, O, F, Fut> Handler<I> for FnHandler<F, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
{
    type Output = O;

    async fn handle(&self, ctx: Context, input: I) -> Result<O, BoxError> {
        (self.f)(ctx, input).await
    }
}
