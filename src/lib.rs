//! Operations core for self-hosted game servers: process supervision, log
//! capture and fan-out, RCON relay, and backup/restore with optional remote
//! mirroring.

pub mod archive;
pub mod backup;
pub mod config;
pub mod core;
pub mod error;
pub mod instance;
pub mod log;
pub mod parser;
pub mod rcon;
pub mod repository;
pub mod store;
#[cfg(feature = "cli")]
pub mod telemetry;
pub mod utils;

pub use crate::core::{CommandReply, Core};
pub use config::CoreConfig;
pub use error::{Error, ErrorKind, Result};
pub use instance::{InstanceId, LifecycleState, ManagedInstance};
pub use repository::{MemoryRepository, Repository};
