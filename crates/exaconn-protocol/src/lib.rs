pub mod codec;
pub mod http;
pub mod messages;
pub mod tunnel;

pub use codec::{Frame, WireCodec};
pub use messages::{Attributes, Request, Response, Status};
pub use tunnel::ProxyAddress;

#[cfg(test)]
mod tests;
