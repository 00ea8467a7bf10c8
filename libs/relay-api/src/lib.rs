pub mod error;
pub mod message;
pub mod record;
pub mod source;
pub mod warehouse;

pub use error::{ConnectorError, ErrorKind};
pub use message::ReceivedMessage;
pub use record::Record;
pub use source::PullSource;
pub use warehouse::{JobId, JobStatus, TableRef, Warehouse};
