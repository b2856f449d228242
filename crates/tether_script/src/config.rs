//! Runtime configuration
//!
//! Plain serde-backed settings; everything has a default so partial JSON
//! documents are accepted.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default capacity of the cross-thread task queue.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine heap limit in bytes. `None` means unlimited.
    pub memory_limit: Option<usize>,
    /// Allocation volume that triggers an engine cycle collection.
    pub gc_threshold: Option<usize>,
    /// Maximum native stack the engine may use, in bytes.
    pub max_stack_size: Option<usize>,
    /// Bounded queue capacity for tasks submitted from other threads.
    pub task_queue_capacity: usize,
    /// Route engine allocations through the Rust global allocator.
    pub custom_allocator: bool,
    /// Name of the background thread that drives timers.
    pub timer_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            gc_threshold: None,
            max_stack_size: None,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            custom_allocator: true,
            timer_thread_name: "tether-timers".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.task_queue_capacity = capacity;
        self
    }

    pub fn with_custom_allocator(mut self, enabled: bool) -> Self {
        self.custom_allocator = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_queue_capacity == 0 {
            return Err(Error::Config(
                "task_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.timer_thread_name.is_empty() {
            return Err(Error::Config("timer_thread_name must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "memory_limit": 1048576 }"#).unwrap();
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert_eq!(config.task_queue_capacity, DEFAULT_TASK_QUEUE_CAPACITY);
        assert!(config.custom_allocator);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "task_queue_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builders_chain() {
        let config = RuntimeConfig::new()
            .with_gc_threshold(4096)
            .with_max_stack_size(512 * 1024)
            .with_task_queue_capacity(8);
        assert_eq!(config.gc_threshold, Some(4096));
        assert_eq!(config.task_queue_capacity, 8);
        assert!(config.validate().is_ok());
    }
}
