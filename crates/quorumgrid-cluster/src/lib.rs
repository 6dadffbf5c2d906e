//! quorumgrid-cluster — clustered database bootstrap for controller nodes.
//!
//! Prepares everything the embedded clustered database needs before it
//! starts or joins: a stable bind address, mutually authenticated TLS
//! anchored on the shared cluster CA, and the list of peers to join.
//!
//! # Architecture
//!
//! ```text
//! ClusterOptionFactory
//!   ├── ensure_data_dir()      → <data_dir>/dqlite (0700)
//!   ├── with_log_option()      → TracingLogSink
//!   ├── with_address_option()  → AddressSelector (memoized, cloud-local)
//!   ├── with_tls_option()      → TrustBundle → listen + dial configs
//!   └── with_cluster_option()  → PeerSetResolver (API addrs → peers)
//! ```

pub mod address;
pub mod error;
pub mod log;
pub mod options;
pub mod peers;
pub mod tls;

pub use address::{AddressSelector, InterfaceSource, NetInterface, SystemInterfaces};
pub use error::{ClusterError, ClusterResult};
pub use log::{LogLevel, LogSink, TracingLogSink};
pub use options::{ClusterOption, ClusterOptionFactory, ClusterOptions, NodeBuilder, OptionsSummary};
pub use peers::{PeerSetResolver, resolve_peers};
pub use tls::{ClusterTls, TrustBundle, build_dial_tls, build_listen_tls};
