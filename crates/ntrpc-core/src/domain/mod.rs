pub mod context;
pub mod data;
pub mod decision;
pub mod envelope;
pub mod errors;
pub mod subject;

pub use context::Context;
pub use data::Data;
pub use decision::{Decider, Decision, DefaultDecider};
pub use envelope::{Envelope, EnvelopeStatus, MimeType, SPEC_VERSION};
pub use errors::{BoxError, ErrorKind, ErrorPayload, RpcError, classify};
