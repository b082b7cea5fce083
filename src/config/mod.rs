pub mod settings;

pub use settings::{ConfigError, RotatorSettings, TimingConfig};
