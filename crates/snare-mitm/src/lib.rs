use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

mod cache;

pub use cache::{CacheMetrics, LeafCache};

/// Serial numbers are drawn uniformly from 20 bytes, the upper bound RFC 5280
/// allows.
const SERIAL_NUMBER_BYTES: usize = 20;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, thiserror::Error)]
pub enum MitmError {
    #[error("entropy source unavailable: {0}")]
    RandomnessUnavailable(String),
    #[error("certificate signing failed: {0}")]
    SigningFailed(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("SNI not provided and no fallback host configured")]
    SniRequired,
    #[error("invalid MITM configuration: {0}")]
    InvalidConfiguration(String),
}

impl MitmError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RandomnessUnavailable(_) => "randomness_unavailable",
            Self::SigningFailed(_) => "signing_failed",
            Self::ConfigBuild(_) => "config_build",
            Self::SniRequired => "sni_required",
            Self::InvalidConfiguration(_) => "invalid_configuration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MitmConfig {
    pub organization: String,
    /// Window applied in both directions of "now": leaves are backdated by
    /// the full validity to absorb client clock skew.
    pub validity: Duration,
    pub cache_capacity: usize,
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            organization: "Snare Proxy".to_string(),
            validity: Duration::from_secs(60 * 60),
            cache_capacity: 1024,
        }
    }
}

impl MitmConfig {
    fn validate(&self) -> Result<(), MitmError> {
        if self.organization.trim().is_empty() {
            return Err(MitmError::InvalidConfiguration(
                "organization must not be empty".to_string(),
            ));
        }
        if self.validity.is_zero() {
            return Err(MitmError::InvalidConfiguration(
                "validity must be greater than zero".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(MitmError::InvalidConfiguration(
                "cache_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// The operator-installed CA that signs every forged leaf.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

impl RootAuthority {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, MitmError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            MitmError::InvalidConfiguration(format!("failed to parse CA certificate PEM: {error}"))
        })?;
        let ca_key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
            MitmError::InvalidConfiguration(format!(
                "failed to read issuer metadata from CA certificate: {error}"
            ))
        })?;
        Ok(Self {
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
        })
    }

    /// Generates a fresh CA, mainly for tests and self-bootstrapping
    /// embedders. The CA carries its own SubjectKeyIdentifier and may sign
    /// certificates for the given validity window around "now".
    pub fn generate(
        common_name: &str,
        organization: &str,
        validity: Duration,
    ) -> Result<Self, MitmError> {
        let ca_key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.serial_number = Some(SerialNumber::from(random_serial_bytes()?.to_vec()));
        params.not_before = OffsetDateTime::now_utc() - validity;
        params.not_after = OffsetDateTime::now_utc() + validity;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name.to_string());
        distinguished_name.push(DnType::OrganizationName, organization.to_string());
        params.distinguished_name = distinguished_name;

        let ca_cert = params.self_signed(&ca_key)?;
        let cert_pem = ca_cert.pem();
        let cert_der = ca_cert.der().clone();
        let issuer = Issuer::new(params, ca_key);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

/// One forged end-entity certificate, valid for exactly one host.
///
/// The chain is always `[leaf, ca]` so clients can build a path to the
/// operator-installed root; the private key is the engine-wide shared leaf
/// key.
#[derive(Debug)]
pub struct ForgedLeaf {
    leaf_der: CertificateDer<'static>,
    chain: Vec<CertificateDer<'static>>,
    certified_key: Arc<CertifiedKey>,
    host: String,
    serial: [u8; SERIAL_NUMBER_BYTES],
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl ForgedLeaf {
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.leaf_der
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// True when the leaf still covers `host` at instant `at`. A cached leaf
    /// failing this check must be treated as a cache miss and reissued.
    pub fn is_valid_for(&self, host: &str, at: OffsetDateTime) -> bool {
        self.host == host && at >= self.not_before && at <= self.not_after
    }
}

/// Builds leaf certificates under the root CA.
///
/// The leaf key is generated once and shared across every issuance: handshake
/// latency dominates MITM overhead, and the key never leaves the proxy.
pub struct SigningAuthority {
    root: RootAuthority,
    leaf_key: KeyPair,
    leaf_signing_key: Arc<dyn rustls::sign::SigningKey>,
    leaf_ski: [u8; 32],
    organization: String,
    validity: Duration,
}

impl SigningAuthority {
    pub fn new(root: RootAuthority, config: &MitmConfig) -> Result<Self, MitmError> {
        config.validate()?;
        let leaf_key = KeyPair::generate()?;
        let leaf_ski = Sha256::digest(leaf_key.public_key_raw()).into();

        let leaf_key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let leaf_signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&leaf_key_der)?;

        Ok(Self {
            root,
            leaf_key,
            leaf_signing_key,
            leaf_ski,
            organization: config.organization.clone(),
            validity: config.validity,
        })
    }

    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    /// SHA-256 over the shared leaf key's DER-encoded SubjectPublicKeyInfo.
    /// Every issued leaf carries this SubjectKeyIdentifier.
    pub fn leaf_ski(&self) -> &[u8; 32] {
        &self.leaf_ski
    }

    /// Issues a leaf for `host`. Every call draws a fresh serial; callers are
    /// expected to cache the result per host.
    pub fn issue(&self, host: &str) -> Result<ForgedLeaf, MitmError> {
        let serial_bytes = random_serial_bytes()?;
        let serial = SerialNumber::from(serial_bytes.to_vec());
        let not_before = OffsetDateTime::now_utc() - self.validity;
        let not_after = OffsetDateTime::now_utc() + self.validity;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.serial_number = Some(serial);
        params.not_before = not_before;
        params.not_after = not_after;
        // SubjectKeyIdentifier = SHA-256 over the shared leaf SPKI, matching
        // the precomputed `leaf_ski`.
        params.key_identifier_method = KeyIdMethod::Sha256;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.to_string());
        distinguished_name.push(DnType::OrganizationName, self.organization.clone());
        params.distinguished_name = distinguished_name;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into()?));
        }

        let leaf_cert = params.signed_by(&self.leaf_key, &self.root.issuer)?;
        let leaf_der = leaf_cert.der().clone();
        let chain = vec![leaf_der.clone(), self.root.cert_der.clone()];
        let certified_key = Arc::new(CertifiedKey::new(
            chain.clone(),
            Arc::clone(&self.leaf_signing_key),
        ));

        Ok(ForgedLeaf {
            leaf_der,
            chain,
            certified_key,
            host: host.to_string(),
            serial: serial_bytes,
            not_before,
            not_after,
        })
    }
}

type H2AllowedHosts = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The MITM engine: signing authority plus the per-host leaf cache, exposed
/// to the handshake through rustls' certificate resolver hook.
pub struct MitmEngine {
    authority: SigningAuthority,
    cache: LeafCache,
    h2_allowed_hosts: Option<H2AllowedHosts>,
}

impl MitmEngine {
    pub fn new(root: RootAuthority, config: MitmConfig) -> Result<Self, MitmError> {
        let authority = SigningAuthority::new(root, &config)?;
        Ok(Self {
            authority,
            cache: LeafCache::new(config.cache_capacity),
            h2_allowed_hosts: None,
        })
    }

    pub fn with_h2_allowed_hosts(
        mut self,
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.h2_allowed_hosts = Some(Arc::new(filter));
        self
    }

    pub fn authority(&self) -> &SigningAuthority {
        &self.authority
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.authority.root.cert_der()
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn h2_allowed_host(&self, host: &str) -> bool {
        match &self.h2_allowed_hosts {
            Some(filter) => filter(strip_port(host)),
            None => false,
        }
    }

    /// Certificate selection for one handshake: SNI wins, the fallback
    /// hostname covers SNI-less clients, and both absent is an error. Cached
    /// leaves are revalidated before reuse; invalid hits are reissued.
    pub fn certificate_for(
        &self,
        sni: Option<&str>,
        fallback: Option<&str>,
    ) -> Result<Arc<ForgedLeaf>, MitmError> {
        let host = match sni.filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => fallback
                .filter(|name| !name.is_empty())
                .ok_or(MitmError::SniRequired)?,
        };
        let host = strip_port(host);

        if let Some(leaf) = self.cache.get(host) {
            return Ok(leaf);
        }

        let leaf = Arc::new(self.authority.issue(host)?);
        self.cache.put(host, Arc::clone(&leaf));
        Ok(leaf)
    }

    /// Server-side handshake config with on-the-fly leaf selection.
    ///
    /// `h2` is offered only when a fallback hostname is known and passes the
    /// allowed-hosts filter; SNI-only configs stay on HTTP/1.1 so traffic
    /// never reaches an HTTP/2 path the caller did not opt into.
    pub fn server_config(self: &Arc<Self>, fallback_host: Option<&str>) -> Arc<ServerConfig> {
        let offer_h2 = fallback_host
            .map(|host| self.h2_allowed_host(host))
            .unwrap_or(false);

        let resolver = LeafResolver {
            engine: Arc::clone(self),
            fallback_host: fallback_host.map(|host| host.to_string()),
        };

        let mut config = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

        config.alpn_protocols = if offer_h2 {
            vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
        } else {
            vec![ALPN_HTTP11.to_vec()]
        };

        Arc::new(config)
    }
}

impl std::fmt::Debug for MitmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmEngine").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LeafResolver {
    engine: Arc<MitmEngine>,
    fallback_host: Option<String>,
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.engine
            .certificate_for(client_hello.server_name(), self.fallback_host.as_deref())
            .ok()
            .map(|leaf| leaf.certified_key())
    }
}

/// Client-side config for terminating TLS toward upstreams, trusting the
/// platform web PKI.
pub fn upstream_client_config() -> Arc<ClientConfig> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(client_config_builder().with_root_certificates(root_store).with_no_client_auth())
}

/// Client-side config trusting exactly one CA. Used by tests to speak to the
/// proxy's forged leaves the way a client with the root installed would.
pub fn client_config_trusting(ca: &CertificateDer<'static>) -> Result<Arc<ClientConfig>, MitmError> {
    let mut root_store = RootCertStore::empty();
    root_store.add(ca.clone())?;
    Ok(Arc::new(
        client_config_builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    ))
}

/// Client-side config that skips certificate verification entirely. Only for
/// tests and explicitly-insecure upstream configurations.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    Arc::new(
        client_config_builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth(),
    )
}

fn client_config_builder() -> rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier> {
    ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
}

pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            return &rest[..close];
        }
        return host;
    }
    match host.rsplit_once(':') {
        Some((front, back)) if !front.contains(':') && back.chars().all(|c| c.is_ascii_digit()) => {
            front
        }
        _ => host,
    }
}

fn random_serial_bytes() -> Result<[u8; SERIAL_NUMBER_BYTES], MitmError> {
    let mut bytes = [0_u8; SERIAL_NUMBER_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|error| MitmError::RandomnessUnavailable(error.to_string()))?;
    Ok(bytes)
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
