// Topic Registry
//
// Maps topic names to their partition logs. Logs are opened lazily on
// first reference and live until the broker is closed.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::config::BrokerConfig;
use crate::error::{Result, StorageError};
use crate::log::PartitionLog;
use crate::record::{Offset, Record};

/// Owns one `PartitionLog` per topic under `config.data_dir`.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    topics: RwLock<HashMap<String, Arc<PartitionLog>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)
            .map_err(StorageError::io("creating directory", &config.data_dir))?;

        info!(data_dir = %config.data_dir.display(), "Broker started");

        Ok(Self {
            config,
            topics: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Log for `topic`, opening it on first use.
    pub fn partition(&self, topic: &str) -> Result<Arc<PartitionLog>> {
        if let Some(log) = self.topics.read().get(topic) {
            return Ok(Arc::clone(log));
        }

        validate_topic(topic)?;

        let mut topics = self.topics.write();
        // another caller may have opened it between the two locks
        if let Some(log) = topics.get(topic) {
            return Ok(Arc::clone(log));
        }

        let dir = self.config.data_dir.join(topic);
        let log = match PartitionLog::open(&dir, self.config.log.clone()) {
            Ok(log) => Arc::new(log),
            Err(e) if e.is_corruption() => {
                error!(
                    topic,
                    dir = %dir.display(),
                    error = %e,
                    "Topic data is corrupt, refusing to open it"
                );
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        debug!(topic, "Opened topic");

        topics.insert(topic.to_string(), Arc::clone(&log));
        Ok(log)
    }

    /// Append `payload` to `topic`, returning its offset.
    pub fn append(&self, topic: &str, payload: &[u8]) -> Result<Offset> {
        self.partition(topic)?.append(payload)
    }

    /// Read from `topic`; `max_bytes` is a soft budget.
    pub fn read(
        &self,
        topic: &str,
        start_offset: Offset,
        max_bytes: u32,
    ) -> Result<Vec<Record>> {
        self.partition(topic)?.read(start_offset, u64::from(max_bytes))
    }

    /// Read with the configured default budget.
    pub fn read_default(&self, topic: &str, start_offset: Offset) -> Result<Vec<Record>> {
        self.read(topic, start_offset, self.config.default_max_bytes)
    }

    /// Names of the open topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every open log and forget them.
    pub fn close(&self) -> Result<()> {
        let logs: Vec<_> = self.topics.write().drain().collect();

        let mut first_err = None;
        for (topic, log) in logs {
            if let Err(e) = log.close() {
                first_err.get_or_insert(e);
            }
            debug!(topic, "Closed topic");
        }

        info!(data_dir = %self.config.data_dir.display(), "Broker stopped");
        first_err.map_or(Ok(()), Err)
    }
}

/// Topic names become directory names, so only a safe subset is allowed.
fn validate_topic(topic: &str) -> Result<()> {
    let valid = !topic.is_empty()
        && topic != "."
        && topic != ".."
        && topic
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidTopic(topic.to_string()))
    }
}
