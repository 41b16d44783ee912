//! Input validators.
//!
//! A validator is `validate(data) -> data | error`. It runs after the envelope
//! decoded successfully; its error becomes the cause of an `INVALID_DATA`.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{BoxError, Data, RpcError};

pub trait Validator: Send + Sync {
    /// May normalize the payload it returns.
    fn validate(&self, data: Data) -> Result<Data, BoxError>;
}

/// Validates JSON input by deserializing into `T`.
///
/// The returned payload is `T` serialized again, so defaults and renames
/// declared on `T` are applied.
pub struct Schema<T> {
    _marker: PhantomData<fn() -> T>,
}

pub fn schema<T>() -> Schema<T>
where
    T: DeserializeOwned + Serialize,
{
    Schema {
        _marker: PhantomData,
    }
}

impl<T> Validator for Schema<T>
where
    T: DeserializeOwned + Serialize,
{
    fn validate(&self, data: Data) -> Result<Data, BoxError> {
        let value: T = data.decode_json()?;
        Ok(Data::json(&value)?)
    }
}

/// Validator from a plain function.
pub struct FnValidator<F>(F);

pub fn validator_fn<F>(f: F) -> FnValidator<F>
where
    F: Fn(Data) -> Result<Data, BoxError> + Send + Sync,
{
    FnValidator(f)
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(Data) -> Result<Data, BoxError> + Send + Sync,
{
    fn validate(&self, data: Data) -> Result<Data, BoxError> {
        (self.0)(data)
    }
}

/// Rejects anything that is not binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryOnly;

impl Validator for BinaryOnly {
    fn validate(&self, data: Data) -> Result<Data, BoxError> {
        match data {
            Data::Binary(_) => Ok(data),
            Data::Json(_) => Err(RpcError::invalid_data("expected a binary payload").into()),
        }
    }
}
