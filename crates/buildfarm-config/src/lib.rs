//! KDL configuration parsing for the buildfarm coordinator.
//!
//! This crate handles parsing of:
//! - Coordinator identity and dispatch timing
//! - Urgency weights used by the priority selector
//! - Builder definitions (start pool, resume pool, locks, merging)

pub mod builder;
pub mod error;
pub mod system;

pub use builder::BuilderConfig;
pub use error::{ConfigError, ConfigResult};
pub use system::{SchedulerConfig, UrgencyWeights, load_system_config, parse_system_config};
