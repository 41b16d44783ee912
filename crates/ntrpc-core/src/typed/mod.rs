//! Typed - resolver と入力 validator
//!
//! # 二層構造
//! - **表層（Typed）**: `Handler<I>` trait, `Schema<T>` - serde で型付け
//! - **内部（Dyn）**: `Resolver` / `Validator` trait - object-safe, procedure に格納される

pub mod handler;
pub mod resolver;
pub mod schema;

pub use self::handler::{FnHandler, Handler, TypedResolver, handler_fn};
pub use self::resolver::{FnResolver, Request, Resolver, resolver_fn};
pub use self::schema::{BinaryOnly, FnValidator, Schema, Validator, schema, validator_fn};
