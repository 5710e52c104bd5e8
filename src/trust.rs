use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::CertError;
use crate::model::{CertInfo, CertStatus, TrustedCertificate, Verification};
use crate::storage::{load_json, save_json};

pub const CERTIFICATE_DIR: &str = "certificates";
pub const CACHE_FILE: &str = "server_certificates.json";
pub const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(10);

pub trait CertificateFetcher: Send + Sync {
    fn fetch_leaf(&self, host: &str, port: u16) -> Result<Vec<u8>, CertError>;
}

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

pub fn format_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(":")
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint.trim().replace(':', "").to_ascii_lowercase()
}

fn cache_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

pub fn endpoint_from_url(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => (String::new(), url),
    };
    let default_port = if scheme == "https" { 443 } else { 80 };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }

    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

fn general_name(name: &GeneralName<'_>) -> Option<String> {
    match name {
        GeneralName::DNSName(dns) => Some(format!("DNS:{dns}")),
        GeneralName::RFC822Name(email) => Some(format!("email:{email}")),
        GeneralName::URI(uri) => Some(format!("URI:{uri}")),
        GeneralName::IPAddress(bytes) => {
            let ip = match bytes.len() {
                4 => IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(bytes);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                _ => return None,
            };
            Some(format!("IP:{ip}"))
        }
        _ => None,
    }
}

fn asn1_time(timestamp: i64) -> Result<DateTime<Utc>, CertError> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| CertError::Parse("validity date out of range".to_string()))
}

pub fn parse_certificate(der: &[u8]) -> Result<CertInfo, CertError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|err| CertError::Parse(err.to_string()))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    let subject_alt_names = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(general_name)
            .collect(),
        Ok(None) => Vec::new(),
        Err(err) => return Err(CertError::Parse(err.to_string())),
    };
    let validity = cert.validity();
    Ok(CertInfo {
        fingerprint: fingerprint(der),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        common_name,
        version: cert.version().0 + 1,
        serial_number: hex::encode(cert.raw_serial()),
        not_before: asn1_time(validity.not_before.timestamp())?,
        not_after: asn1_time(validity.not_after.timestamp())?,
        subject_alt_names,
    })
}

/// Accepts whatever chain the server sends and keeps the leaf. Handshake
/// signatures are still checked against that leaf, and the leaf is only
/// handed out once the handshake has completed.
#[derive(Debug)]
struct CaptureVerifier {
    provider: Arc<CryptoProvider>,
    leaf: Mutex<Option<Vec<u8>>>,
}

impl ServerCertVerifier for CaptureVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.leaf.lock() = Some(end_entity.as_ref().to_vec());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct PinnedVerifier {
    provider: Arc<CryptoProvider>,
    expected: String,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if fingerprint(end_entity.as_ref()) == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate fingerprint mismatch".to_string(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn client_config(
    provider: Arc<CryptoProvider>,
    verifier: Arc<dyn ServerCertVerifier>,
) -> Result<ClientConfig, CertError> {
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| CertError::Tls(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

fn map_io(endpoint: &str, err: io::Error) -> CertError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            CertError::Timeout(endpoint.to_string())
        }
        io::ErrorKind::InvalidData => CertError::Tls(err.to_string()),
        _ => CertError::Connection(format!("{endpoint}: {err}")),
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, CertError> {
    let endpoint = cache_key(host, port);
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| CertError::Connection(format!("cannot resolve {host}: {err}")))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).ok();
                stream.set_write_timeout(Some(timeout)).ok();
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => map_io(&endpoint, err),
        None => CertError::Connection(format!("no address for {host}")),
    })
}

pub struct TlsFetcher {
    timeout: Duration,
}

impl TlsFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TlsFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_TLS_TIMEOUT)
    }
}

impl CertificateFetcher for TlsFetcher {
    fn fetch_leaf(&self, host: &str, port: u16) -> Result<Vec<u8>, CertError> {
        let endpoint = cache_key(host, port);
        let verifier = Arc::new(CaptureVerifier {
            provider: crypto_provider(),
            leaf: Mutex::new(None),
        });
        let config = client_config(crypto_provider(), verifier.clone())?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| CertError::Connection(format!("invalid host name {host}: {err}")))?;
        let mut conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|err| CertError::Tls(err.to_string()))?;
        let mut sock = connect_tcp(host, port, self.timeout)?;

        let mut handshake = Ok(());
        while conn.is_handshaking() {
            if let Err(err) = conn.complete_io(&mut sock) {
                handshake = Err(err);
                break;
            }
        }
        let leaf = verifier.leaf.lock().take();
        match (leaf, handshake) {
            (Some(leaf), Ok(())) => Ok(leaf),
            (seen, Err(err)) => {
                tracing::warn!(%endpoint, %err, certificate_seen = seen.is_some(), "tls handshake failed");
                Err(map_io(&endpoint, err))
            }
            (None, Ok(())) => Err(CertError::Tls("server presented no certificate".to_string())),
        }
    }
}

pub struct TrustStore {
    path: PathBuf,
    fetcher: Box<dyn CertificateFetcher>,
    entries: Mutex<BTreeMap<String, TrustedCertificate>>,
}

impl TrustStore {
    pub fn open(dir: &Path, fetcher: Box<dyn CertificateFetcher>) -> Self {
        let path = dir.join(CACHE_FILE);
        let entries = match load_json::<BTreeMap<String, TrustedCertificate>>(&path) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(%err, "certificate cache unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            path,
            fetcher,
            entries: Mutex::new(entries),
        }
    }

    pub fn get_certificate_info(&self, host: &str, port: u16) -> Result<CertInfo, CertError> {
        let der = self.fetcher.fetch_leaf(host, port)?;
        parse_certificate(&der)
    }

    pub fn verify_certificate(&self, host: &str, port: u16) -> Verification {
        let info = match self.get_certificate_info(host, port) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(host, port, %err, "certificate check failed");
                return Verification {
                    status: CertStatus::Error,
                    info: None,
                    error: Some(err.to_string()),
                };
            }
        };
        let status = match self.entries.lock().get(&cache_key(host, port)) {
            Some(pinned) if pinned.fingerprint == info.fingerprint => CertStatus::Trusted,
            Some(pinned) => {
                tracing::warn!(
                    host,
                    port,
                    pinned = %pinned.fingerprint,
                    presented = %info.fingerprint,
                    "certificate changed since it was trusted"
                );
                CertStatus::Changed
            }
            None => CertStatus::New,
        };
        Verification {
            status,
            info: Some(info),
            error: None,
        }
    }

    /// Pins `info` (or the live certificate when `None`) for the endpoint,
    /// replacing any earlier pin.
    pub fn trust_certificate(
        &self,
        host: &str,
        port: u16,
        info: Option<&CertInfo>,
    ) -> Result<TrustedCertificate, CertError> {
        let fetched;
        let info = match info {
            Some(info) => info,
            None => {
                fetched = self.get_certificate_info(host, port)?;
                &fetched
            }
        };
        let record = TrustedCertificate {
            host: host.to_string(),
            port,
            fingerprint: normalize_fingerprint(&info.fingerprint),
            subject: info.subject.clone(),
            issuer: info.issuer.clone(),
            not_after: info.not_after,
            trusted_at: Utc::now(),
        };
        let mut entries = self.entries.lock();
        entries.insert(cache_key(host, port), record.clone());
        self.persist(&entries)?;
        tracing::info!(host, port, fingerprint = %record.fingerprint, "trusted certificate");
        Ok(record)
    }

    pub fn remove_certificate(&self, host: &str, port: u16) -> Result<bool, CertError> {
        let mut entries = self.entries.lock();
        if entries.remove(&cache_key(host, port)).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        tracing::info!(host, port, "removed trusted certificate");
        Ok(true)
    }

    pub fn cached_certificate(&self, host: &str, port: u16) -> Option<TrustedCertificate> {
        self.entries.lock().get(&cache_key(host, port)).cloned()
    }

    pub fn trusted_certificates(&self) -> Vec<TrustedCertificate> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn pinned_client_config(&self, host: &str, port: u16) -> Result<ClientConfig, CertError> {
        let pinned = self
            .cached_certificate(host, port)
            .ok_or_else(|| CertError::NotTrusted(cache_key(host, port)))?;
        let verifier = Arc::new(PinnedVerifier {
            provider: crypto_provider(),
            expected: pinned.fingerprint,
        });
        client_config(crypto_provider(), verifier)
    }

    fn persist(&self, entries: &BTreeMap<String, TrustedCertificate>) -> Result<(), CertError> {
        save_json(&self.path, entries).map_err(|err| {
            tracing::error!(%err, "could not save certificate cache");
            CertError::Storage(err.to_string())
        })
    }
}

#[cfg(test)]
pub(crate) struct MockFetcher {
    certs: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockFetcher {
    pub(crate) fn new() -> Self {
        Self {
            certs: Mutex::new(std::collections::HashMap::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub(crate) fn serve(&self, host: &str, port: u16, der: &[u8]) {
        self.certs.lock().insert(cache_key(host, port), der.to_vec());
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl CertificateFetcher for Arc<MockFetcher> {
    fn fetch_leaf(&self, host: &str, port: u16) -> Result<Vec<u8>, CertError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.certs
            .lock()
            .get(&cache_key(host, port))
            .cloned()
            .ok_or_else(|| CertError::Connection(format!("connection refused by {host}:{port}")))
    }
}
