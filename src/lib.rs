//! Client-side synchronization of feature flag configurations and targeted cohorts.
//!
//! # Overview
//!
//! A [`DeploymentRunner`] keeps an in-memory copy of a deployment's flag configurations and of the
//! cohorts those flags target. An evaluation engine reads consistent snapshots from its
//! [`FlagConfigStorage`](storage::FlagConfigStorage) and
//! [`CohortStorage`](storage::CohortStorage) without ever blocking on the network.
//!
//! Flag configurations are either polled periodically or, with
//! [`SyncConfig::stream_updates`], pushed over a server-sent events stream. When the stream is
//! unavailable the runner polls instead and keeps trying to restore the stream in the background.
//! Cohorts referenced by a flag are downloaded before the flag is published, and are refreshed
//! periodically afterwards.
//!
//! An [`AssignmentService`](assignment::AssignmentService) can be used to report evaluation
//! results to an analytics backend, deduplicated so that each distinct assignment is reported
//! once per day.
//!
//! ```no_run
//! # use flagsync::{CohortSyncConfig, SyncConfig};
//! let mut config = SyncConfig::from_deployment_key("server-deployment-key");
//! config
//!     .stream_updates(true)
//!     .cohort_sync_config(CohortSyncConfig::new("api-key", "secret-key"));
//!
//! let runner = config.to_runner()?;
//! runner.start()?;
//!
//! let flags = runner.flag_config_storage().get_flag_configs();
//! # Ok::<(), flagsync::Error>(())
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Failures of the initial load are returned from
//! [`DeploymentRunner::start`]; after that, the runner recovers from failures on its own and only
//! logs them. Readers always see the last configuration that was loaded successfully.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with the `flagsync` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into synchronization.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod assignment;
pub mod backoff;
pub mod cache;
pub mod cohort;
pub mod cohort_loader;
mod config;
mod error;
pub mod flag;
mod runner;
pub mod scheduler;
pub mod sse;
pub mod storage;
pub mod updater;
pub mod util;

pub use config::{AssignmentConfig, CohortSyncConfig, SyncConfig};
pub use error::{Error, Result, StreamError};
pub use runner::{DeploymentRunner, RunnerSources};
