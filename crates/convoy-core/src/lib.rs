pub mod config;
pub mod types;

pub use config::ConvoyConfig;
pub use types::*;
