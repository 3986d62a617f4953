pub mod config;
pub mod info;
mod metrics;
mod parse;
pub mod relay;
pub mod splice;
pub mod supervisor;
mod util;

#[cfg(test)]
mod tests;

pub use {
    config::{Config, ConfigError},
    metrics::{MetricsSnapshot, RelayMetrics},
    parse::{BodyLength, HttpRequest, HttpResponse},
    relay::{Dispatch, Relay},
    splice::{SpliceEnd, SpliceError, SpliceOpts, SpliceStats},
    supervisor::{BootstrapError, Supervisor},
    util::Prebuffered,
};
