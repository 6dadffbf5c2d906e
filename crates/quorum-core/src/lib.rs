pub mod config;
pub mod error;
pub mod scope;

pub use config::{AgentConfig, ServingInfo};
pub use config::{CONTROLLER_NAMESPACE, DEFAULT_API_PORT, DEFAULT_CLUSTER_PORT, DQLITE_SUBDIR};
pub use error::{AddressError, ConfigError};
pub use scope::{Scope, classify_host, classify_ip, join_host_port, split_host_port};
