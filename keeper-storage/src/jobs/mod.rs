//! Background jobs for Keeper.
//!
//! - `housekeeping`: evicts tenant stores that have been idle too long
//!
//! # Usage
//!
//! ```ignore
//! use keeper_storage::jobs::{housekeeping_task, HousekeepingConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let config = HousekeepingConfig::from_config(provider.config());
//! tokio::spawn(housekeeping_task(Arc::clone(&provider), config, shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! provider.close_all().await?;
//! ```

pub mod housekeeping;

pub use housekeeping::{
    housekeeping_task, HousekeepingConfig, HousekeepingMetrics, HousekeepingSnapshot,
};
