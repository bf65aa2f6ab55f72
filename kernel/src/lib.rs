// Ember Kernel
//
// Append-only, offset-indexed partition logs: the storage engine
// behind a message broker's topics.

pub mod broker;
pub mod config;
pub mod error;
pub mod log;
pub mod record;
pub mod segment;

pub use broker::Broker;
pub use config::{BrokerConfig, LogConfig};
pub use error::{Result, StorageError};
pub use log::PartitionLog;
pub use record::{Offset, Record};
