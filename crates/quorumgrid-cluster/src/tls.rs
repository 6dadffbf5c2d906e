//! mTLS material for database replication traffic.
//!
//! Every controller node holds the shared cluster CA plus its own
//! CA-signed certificate. From that trust bundle two configurations are
//! built:
//!
//! - **listen**: requires connecting peers to present a certificate
//!   chaining to the CA, and presents this node's certificate.
//! - **dial**: presents this node's certificate and verifies the remote
//!   chain against the CA, but does *not* match the certificate against
//!   the dialled name. Advertised peer addresses move around and are not
//!   guaranteed to appear in any SAN, so trust is anchored on the CA alone.

use std::net::IpAddr;
use std::sync::Arc;

use quorum_core::{AgentConfig, ServingInfo, split_host_port};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// A freshly generated cluster CA, able to sign node certificates.
pub struct ClusterCa {
    pub pair: CertKeyPair,
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Generate a self-signed CA certificate for the cluster.
pub fn generate_ca() -> ClusterResult<ClusterCa> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "QuorumGrid");
    dn.push(DnType::CommonName, "QuorumGrid Cluster CA");
    params.distinguished_name = dn;

    params.not_after = rcgen::date_time_ymd(2046, 1, 1);

    let key = KeyPair::generate().map_err(cert_err)?;
    let cert = params.self_signed(&key).map_err(cert_err)?;

    info!("generated cluster CA certificate");

    Ok(ClusterCa {
        pair: CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        },
        cert,
        key,
    })
}

/// Generate a node certificate signed by the cluster CA.
///
/// Addresses become IP or DNS SANs. Peers never check them when dialling,
/// but other clients of the node may.
pub fn generate_node_cert(
    ca: &ClusterCa,
    node_id: &str,
    addresses: &[String],
) -> ClusterResult<CertKeyPair> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "QuorumGrid");
    dn.push(DnType::CommonName, node_id);
    params.distinguished_name = dn;

    for addr in addresses {
        if let Ok(ip) = addr.parse::<IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        } else {
            params.subject_alt_names.push(rcgen::SanType::DnsName(
                addr.clone().try_into().map_err(cert_err)?,
            ));
        }
    }

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let node_key = KeyPair::generate().map_err(cert_err)?;
    let node_cert = params
        .signed_by(&node_key, &ca.cert, &ca.key)
        .map_err(cert_err)?;

    info!(%node_id, sans = addresses.len(), "generated node certificate");

    Ok(CertKeyPair {
        cert_pem: node_cert.pem(),
        key_pem: node_key.serialize_pem(),
    })
}

fn cert_err(e: rcgen::Error) -> ClusterError {
    ClusterError::Certificate(e.to_string())
}

/// The shared CA pool plus this node's certificate chain and key.
pub struct TrustBundle {
    roots: Arc<RootCertStore>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustBundle")
            .field("roots", &self.roots.len())
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl TrustBundle {
    /// Parse a bundle from PEM text.
    pub fn from_pem(ca_pem: &str, cert_pem: &str, key_pem: &str) -> ClusterResult<Self> {
        let ca_certs = parse_certificates(ca_pem)?;
        if ca_certs.is_empty() {
            return Err(ClusterError::Certificate("no CA certificates found".into()));
        }

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(|e| {
                ClusterError::Certificate(format!("failed to add CA certificate: {e}"))
            })?;
        }

        let chain = parse_certificates(cert_pem)?;
        if chain.is_empty() {
            return Err(ClusterError::Certificate("no node certificates found".into()));
        }

        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| ClusterError::Certificate(format!("reading private key: {e}")))?
            .ok_or_else(|| ClusterError::Certificate("no private key found".into()))?;

        Ok(Self {
            roots: Arc::new(roots),
            chain,
            key,
        })
    }

    /// Build the bundle from a CA and this node's serving credentials.
    ///
    /// Nodes without serving credentials cannot take part in replication
    /// and get [`ClusterError::NotSupported`].
    pub fn from_serving(ca_pem: &str, serving: Option<&ServingInfo>) -> ClusterResult<Self> {
        let serving = serving.ok_or_else(|| {
            ClusterError::NotSupported("node has no server-serving credentials".into())
        })?;
        Self::from_pem(ca_pem, &serving.cert, &serving.private_key)
    }

    pub fn from_agent_config(config: &AgentConfig) -> ClusterResult<Self> {
        Self::from_serving(&config.ca_cert, config.serving.as_ref())
    }

    /// Server-side config: peers must authenticate against the CA.
    pub fn listen_config(&self) -> ClusterResult<Arc<ServerConfig>> {
        let provider = crypto_provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), Arc::clone(&provider))
                .build()
                .map_err(|e| ClusterError::Tls(format!("client verifier: {e}")))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClusterError::Tls(format!("protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| ClusterError::Tls(format!("server config: {e}")))?;

        Ok(Arc::new(config))
    }

    /// Client-side config: presents our identity, verifies the peer's
    /// chain against the CA, and skips server name matching.
    pub fn dial_config(&self) -> ClusterResult<Arc<ClientConfig>> {
        let provider = crypto_provider();
        let verifier = CaAnchoredVerifier {
            roots: Arc::clone(&self.roots),
            provider: Arc::clone(&provider),
        };

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClusterError::Tls(format!("protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| ClusterError::Tls(format!("client config: {e}")))?;

        Ok(Arc::new(config))
    }
}

/// Listen-side TLS for a node; NotSupported without serving credentials.
pub fn build_listen_tls(
    ca_pem: &str,
    serving: Option<&ServingInfo>,
) -> ClusterResult<Arc<ServerConfig>> {
    TrustBundle::from_serving(ca_pem, serving)?.listen_config()
}

/// Dial-side TLS for a node; NotSupported without serving credentials.
pub fn build_dial_tls(
    ca_pem: &str,
    serving: Option<&ServingInfo>,
) -> ClusterResult<Arc<ClientConfig>> {
    TrustBundle::from_serving(ca_pem, serving)?.dial_config()
}

/// Both halves of a node's replication TLS.
#[derive(Clone)]
pub struct ClusterTls {
    pub listen: Arc<ServerConfig>,
    pub dial: Arc<ClientConfig>,
}

impl std::fmt::Debug for ClusterTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTls").finish_non_exhaustive()
    }
}

impl ClusterTls {
    pub fn from_bundle(bundle: &TrustBundle) -> ClusterResult<Self> {
        Ok(Self {
            listen: bundle.listen_config()?,
            dial: bundle.dial_config()?,
        })
    }

    pub fn from_agent_config(config: &AgentConfig) -> ClusterResult<Self> {
        Self::from_bundle(&TrustBundle::from_agent_config(config)?)
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.listen))
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.dial))
    }
}

/// Server name to hand rustls when dialling a `host:port` peer address.
///
/// The dial verifier ignores it; rustls still needs one for SNI.
pub fn dial_server_name(peer: &str) -> ClusterResult<ServerName<'static>> {
    let (host, _) = split_host_port(peer)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host)
        .map_err(|e| ClusterError::Tls(format!("invalid peer name {peer:?}: {e}")))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn parse_certificates(pem: &str) -> ClusterResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Certificate(format!("reading certificates: {e}")))
}

/// Verifies a server chain against the cluster CA without name matching.
#[derive(Debug)]
struct CaAnchoredVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for CaAnchoredVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        debug!(server_name = ?server_name, "peer certificate chains to cluster CA");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
