//! Core domain models and shared infrastructure for APMRouter.
//!
//! This module contains the metric model, the error type, configuration
//! and the reusable delay queue used by the data plane.

pub mod config;
pub mod delay_queue;
pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, ConfigWatcher};
pub use delay_queue::DelayQueue;
pub use error::{ApmError, Result};
pub use types::{Metric, MetricIdentity, MetricType, MetricValue, NO_TOKEN};
