//! TOML configuration for pools and logging.
//!
//! Loaded from `werkstatt.toml` (see `config/werkstatt.toml` at the repo
//! root), then overridden from `WERKSTATT_<SECTION>_<KEY>` environment
//! variables, then validated.

mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use types::{LogConfig, PoolConfig, WerkstattConfig, DEFAULT_POOL_SIZE};
