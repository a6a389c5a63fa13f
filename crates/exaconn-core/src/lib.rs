pub mod error;
pub mod host;
pub mod types;

pub use error::{ErrorKind, ExaError, Result};
pub use host::{Fingerprint, Host, DEFAULT_PORT};
pub use types::{Column, DataType, DataValue, ResultKind};
