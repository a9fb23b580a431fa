pub mod config;
pub mod error;
pub mod types;

pub use config::{limits, ConfigError, RelayConfig};
pub use error::{Result, VeilnetError};
pub use types::{TargetAddr, TargetAddrError};
