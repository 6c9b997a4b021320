//! SkyProxy Agent - applying proxy profiles.
//!
//! This crate connects the pure profile logic of `skyproxy-core` to the
//! outside world:
//!
//! - [`sink`] / [`system`]: where the active proxy configuration lives
//!   (the key-value store, or GNOME's system proxy settings)
//! - [`probe`]: connectivity test through a proxy
//! - [`protocol`] / [`background`]: typed request/response messages and the
//!   dispatcher that owns the sink and probe
//! - [`controller`]: the profile collection, its persistence, and every
//!   user-facing operation on it
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skyproxy_agent::{AgentConfig, Background, HttpProbe, ProfileController, StoredSink};
//! use skyproxy_storage::Database;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Arc::new(Database::in_memory()?);
//! let config = AgentConfig::default();
//! let background = Background::new(
//!     Arc::new(StoredSink::new(db.clone())),
//!     Arc::new(HttpProbe::new(&config)),
//!     &config,
//! );
//! let controller = ProfileController::new(db, Arc::new(background));
//! let report = controller.load().await?;
//! println!("{} profiles", report.loaded);
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod config;
pub mod controller;
pub mod error;
pub mod probe;
pub mod protocol;
pub mod sink;
pub mod store;
pub mod system;

#[cfg(test)]
pub(crate) mod testing;

pub use background::Background;
pub use config::AgentConfig;
pub use controller::{LoadReport, ProfileController, ProfileState};
pub use error::{ControllerError, ProbeError, Result, SinkError, StoreError};
pub use probe::{ConnectivityProbe, HttpProbe};
pub use protocol::{FailureReason, Messenger, Request, Response};
pub use sink::{ProxySettingsSink, StoredSink};
pub use store::KeyValueStore;
pub use system::GnomeProxySink;
