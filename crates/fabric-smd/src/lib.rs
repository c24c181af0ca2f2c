//! Fabric subnet manager daemon
//!
//! The daemon shell around `fabric-sm-core`: TOML configuration with
//! command line overrides, GUID to LID persistence across restarts, and the
//! run loop driving the sweep scheduler over a probe transport.

pub mod config_file;
pub mod daemon;
pub mod error;
pub mod guid2lid;

pub use config_file::{DaemonConfig, Overrides, SmdConfig, DEFAULT_CONFIG_PATH};
pub use daemon::{load_topology, SmDaemon};
pub use error::{Result, SmdError};
pub use guid2lid::{Guid2LidFile, Guid2LidStore, GUID2LID_VERSION};
