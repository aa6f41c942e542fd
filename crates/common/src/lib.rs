//! Common types for the credential engine workspace

mod error;
mod secret;
mod source;

pub use error::{Error, Result};
pub use secret::Secret;
pub use source::SecretSource;
