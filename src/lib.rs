// GTFS schedule sync
//
// Keeps a local store in step with the newest published GTFS schedule archive, restricted to a
// configured set of transport modes and per-mode files.

pub mod archive;
pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod metadata;
pub mod mirror;
pub mod pipeline;
pub mod reaper;
pub mod server;
pub mod store;
pub mod transport_types;
pub mod version;

pub use config::Config;
pub use error::{IngestError, Result};
pub use pipeline::{Pipeline, RunOutcome};
pub use store::Store;
