pub mod data;
pub mod io;

pub use data::{Capability, McpServerConfig, McpSettings};
pub use io::ConfigError;
