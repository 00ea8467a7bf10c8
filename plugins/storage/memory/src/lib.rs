//! In-process `PullSource` and `Warehouse`.
//!
//! Both keep their whole state behind a mutex and expose inspection helpers,
//! which makes them the backends of choice for tests and dry runs.

mod source;
mod warehouse;

pub use source::MemorySource;
pub use warehouse::MemoryWarehouse;
