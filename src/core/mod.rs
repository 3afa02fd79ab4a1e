//! Core configuration for Flowstate.

mod config;

pub use config::{BusConfig, Config, StoreConfig, CONFIG_ENV};
