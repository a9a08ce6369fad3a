//! Logging setup and observability helpers shared by the metadata engine crates.

pub mod logging;
pub mod operation_id;

pub use self::operation_id::OperationId;
