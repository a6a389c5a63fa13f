pub mod compression;
pub mod endpoint;
pub mod orphan;
pub mod process;
pub mod tls;

pub use endpoint::{TransferStats, TunnelEndpoint, TunnelMode, TunnelOptions};
pub use process::{ProcessWorker, ProcessWorkerConfig};

#[cfg(test)]
mod tests;
