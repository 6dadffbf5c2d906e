//! Database option factory.
//!
//! Composes the bind address, replication TLS, peer list and log sink
//! into the option bundle consumed by the embedded clustered database
//! when it starts or joins. The factory never starts the engine itself;
//! creating the data directory is its only side effect.

use std::path::PathBuf;
use std::sync::Arc;

use quorum_core::{AgentConfig, join_host_port};
use rustls::{ClientConfig, ServerConfig};
use serde::Serialize;
use tracing::info;

use crate::address::{AddressSelector, InterfaceSource, SystemInterfaces};
use crate::error::{ClusterError, ClusterResult};
use crate::log::{LogSink, TracingLogSink};
use crate::peers::PeerSetResolver;
use crate::tls::ClusterTls;

/// Builder surface of the external database engine.
///
/// Options may be applied in any order.
pub trait NodeBuilder {
    fn set_log_sink(&mut self, sink: Arc<dyn LogSink>);
    fn set_bind_address(&mut self, address: &str);
    fn set_tls(&mut self, listen: Arc<ServerConfig>, dial: Arc<ClientConfig>);
    fn set_cluster(&mut self, peers: &[String]);
}

/// A single, independent engine directive.
#[derive(Clone)]
pub enum ClusterOption {
    LogSink(Arc<dyn LogSink>),
    /// `host:cluster_port` the engine listens on and advertises.
    Address(String),
    Tls(ClusterTls),
    /// Join candidates; empty means bootstrap a fresh cluster.
    Cluster(Vec<String>),
}

impl ClusterOption {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterOption::LogSink(_) => "log",
            ClusterOption::Address(_) => "address",
            ClusterOption::Tls(_) => "tls",
            ClusterOption::Cluster(_) => "cluster",
        }
    }

    pub fn apply(&self, builder: &mut dyn NodeBuilder) {
        match self {
            ClusterOption::LogSink(sink) => builder.set_log_sink(Arc::clone(sink)),
            ClusterOption::Address(address) => builder.set_bind_address(address),
            ClusterOption::Tls(tls) => {
                builder.set_tls(Arc::clone(&tls.listen), Arc::clone(&tls.dial))
            }
            ClusterOption::Cluster(peers) => builder.set_cluster(peers),
        }
    }
}

impl std::fmt::Debug for ClusterOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterOption::LogSink(_) => f.write_str("LogSink"),
            ClusterOption::Address(a) => f.debug_tuple("Address").field(a).finish(),
            ClusterOption::Tls(_) => f.write_str("Tls"),
            ClusterOption::Cluster(p) => f.debug_tuple("Cluster").field(p).finish(),
        }
    }
}

/// The prepared option bundle plus the data directory it belongs to.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub data_dir: PathBuf,
    options: Vec<ClusterOption>,
}

/// Serializable description of a [`ClusterOptions`] bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionsSummary {
    pub data_dir: PathBuf,
    pub address: Option<String>,
    pub peers: Vec<String>,
    pub tls: bool,
    pub log_sink: bool,
}

impl ClusterOptions {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            options: Vec::new(),
        }
    }

    pub fn push(&mut self, option: ClusterOption) {
        self.options.push(option);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Hand every directive to the engine builder.
    pub fn apply(&self, builder: &mut dyn NodeBuilder) {
        for option in &self.options {
            option.apply(builder);
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            ClusterOption::Address(a) => Some(a.as_str()),
            _ => None,
        })
    }

    pub fn peers(&self) -> &[String] {
        self.options
            .iter()
            .find_map(|o| match o {
                ClusterOption::Cluster(p) => Some(p.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn has_tls(&self) -> bool {
        self.options.iter().any(|o| matches!(o, ClusterOption::Tls(_)))
    }

    pub fn summary(&self) -> OptionsSummary {
        OptionsSummary {
            data_dir: self.data_dir.clone(),
            address: self.address().map(str::to_string),
            peers: self.peers().to_vec(),
            tls: self.has_tls(),
            log_sink: self
                .options
                .iter()
                .any(|o| matches!(o, ClusterOption::LogSink(_))),
        }
    }
}

/// Produces engine options from a validated agent config.
pub struct ClusterOptionFactory<S = SystemInterfaces> {
    config: AgentConfig,
    selector: AddressSelector<S>,
    resolver: PeerSetResolver,
    log_sink: Arc<dyn LogSink>,
}

impl ClusterOptionFactory<SystemInterfaces> {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_selector(config, AddressSelector::new())
    }
}

impl<S: InterfaceSource> ClusterOptionFactory<S> {
    /// Use a specific address selector. An explicit `bind_address` in the
    /// config is applied as an override.
    pub fn with_selector(config: AgentConfig, selector: AddressSelector<S>) -> Self {
        if let Some(ip) = config.bind_address {
            selector.set_bind_address_override(ip);
        }
        Self {
            resolver: PeerSetResolver::new(config.cluster_port),
            config,
            selector,
            log_sink: Arc::new(TracingLogSink),
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn selector(&self) -> &AddressSelector<S> {
        &self.selector
    }

    /// Create the database directory (owner-only) if it is missing.
    pub async fn ensure_data_dir(&self) -> ClusterResult<PathBuf> {
        let dir = self.config.dqlite_dir();

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&dir).await.map_err(|source| ClusterError::Io {
            path: dir.clone(),
            source,
        })?;

        info!(path = ?dir, "database directory ready");
        Ok(dir)
    }

    pub fn with_log_option(&self) -> ClusterOption {
        ClusterOption::LogSink(Arc::clone(&self.log_sink))
    }

    /// Bind address option. Mandatory for every node.
    pub fn with_address_option(&self) -> ClusterResult<ClusterOption> {
        let ip = self
            .selector
            .ensure_bind_address()
            .map_err(|e| e.in_option("address"))?;
        Ok(ClusterOption::Address(join_host_port(
            &ip.to_string(),
            self.resolver.cluster_port(),
        )))
    }

    /// Replication TLS option. NotSupported for nodes without serving
    /// credentials.
    pub fn with_tls_option(&self) -> ClusterResult<ClusterOption> {
        let tls = ClusterTls::from_agent_config(&self.config).map_err(|e| e.in_option("tls"))?;
        Ok(ClusterOption::Tls(tls))
    }

    /// Peer list option computed from the controller API addresses.
    pub fn with_cluster_option(&self) -> ClusterResult<ClusterOption> {
        let ip = self
            .selector
            .ensure_bind_address()
            .map_err(|e| e.in_option("cluster"))?;
        let peers = self
            .resolver
            .resolve(&ip.to_string(), &self.config.api_addresses);
        Ok(ClusterOption::Cluster(peers))
    }

    /// Prepare the data directory and the full option bundle.
    ///
    /// TLS is skipped for standalone nodes; the peer list is skipped when
    /// there is nobody to join.
    pub async fn build(&self) -> ClusterResult<ClusterOptions> {
        let data_dir = self.ensure_data_dir().await?;
        let mut options = ClusterOptions::new(data_dir);

        options.push(self.with_log_option());
        options.push(self.with_address_option()?);

        match self.with_tls_option() {
            Ok(option) => options.push(option),
            Err(e) if e.is_not_supported() => {
                info!("node has no serving credentials; replication TLS disabled");
            }
            Err(e) => return Err(e),
        }

        match self.with_cluster_option()? {
            ClusterOption::Cluster(peers) if peers.is_empty() => {
                info!("no cluster peers; bootstrapping a new cluster");
            }
            option => options.push(option),
        }

        info!(
            controller_id = self.config.controller_id.as_deref().unwrap_or("-"),
            address = options.address().unwrap_or("-"),
            peers = options.peers().len(),
            tls = options.has_tls(),
            "database options prepared"
        );
        Ok(options)
    }
}
