//! APMRouter - metrics ingestion and routing backbone.
//!
//! Agents send metric frames over UDP. APMRouter resolves every sample to a
//! stable identity, hands agents compact tokens to use in place of full
//! names, conflates bursts of samples per identity and fans the result out to
//! destinations subscribed by name pattern.
//!
//! # Architecture
//!
//! - `core`: metric model, configuration, errors and the delay queue
//! - `catalog`: identity catalog and token assignment
//! - `receiver`: wire codec, agent reply channels and the ingestion handler
//! - `router`: pattern matching, conflation and destination fan-out
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use apmrouter::core::Config;
//! use apmrouter::Application;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let app = Application::new(config).await?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod application;
pub mod catalog;
pub mod cli;
pub mod core;
pub mod receiver;
pub mod router;

pub use crate::application::Application;
pub use crate::core::{ApmError, Config, Result};
