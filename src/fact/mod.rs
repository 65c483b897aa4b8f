//! Facts and the append-only log that stores them.

pub mod log;
pub mod table;
pub mod types;

pub use log::{FactIter, FactLog, LineError};
pub use table::{FactTable, LoadReport};
pub use types::{Fact, FactType, NewFact, Quality};
