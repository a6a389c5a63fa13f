pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod dsn;
pub mod session;
pub mod statement;
pub mod websocket;

pub use bulk::{ExportQuery, ImportQuery, TransferOptions, TransferReport};
pub use config::ConnectOptions;
pub use coordinator::{ParallelOptions, WorkerMode};
pub use decode::{ColumnNamePolicy, MapDecoder, NamedRow, RowDecoder, TupleDecoder};
pub use exaconn_core::{ErrorKind, ExaError, Result};
pub use session::{Session, SessionState};
pub use statement::Statement;

#[cfg(any(test, feature = "test-support"))]
pub mod mock_server;
