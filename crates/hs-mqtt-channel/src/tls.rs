//! TLS configuration for mTLS connections to AWS IoT Core.
//!
//! Loads the X.509 device certificate, private key, and CA certificate
//! from PEM files, validates them with rustls, and configures rumqttc's
//! TLS transport.

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rumqttc::{TlsConfiguration, Transport};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, InconsistentKeys, RootCertStore};

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};

/// ALPN protocol AWS IoT Core requires for MQTT over port 443.
pub const AWS_IOT_ALPN: &[u8] = b"x-amzn-mqtt-ca";

/// Paths to the device credential material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_cert: PathBuf,
    pub private_key: PathBuf,
    pub root_ca: PathBuf,
}

impl Credentials {
    pub fn new(
        client_cert: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        root_ca: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client_cert: client_cert.into(),
            private_key: private_key.into(),
            root_ca: root_ca.into(),
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(
            &config.client_cert_path,
            &config.client_key_path,
            &config.ca_cert_path,
        )
    }
}

/// Validated TLS client context.
///
/// Holds the PEM material rumqttc needs. The files have already been
/// accepted by a rustls client config (TLS 1.2 and 1.3 only); rumqttc
/// builds its own session from the same bytes.
#[derive(Clone)]
pub struct TlsContext {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    alpn: Option<Vec<Vec<u8>>>,
}

impl TlsContext {
    /// Advertise the AWS IoT ALPN protocol (needed when connecting on 443).
    pub fn with_aws_iot_alpn(mut self) -> Self {
        self.alpn = Some(vec![AWS_IOT_ALPN.to_vec()]);
        self
    }

    /// rumqttc transport carrying the validated material.
    pub fn transport(&self) -> Transport {
        Transport::tls_with_config(TlsConfiguration::Simple {
            ca: self.ca_pem.clone(),
            alpn: self.alpn.clone(),
            client_auth: Some((self.cert_pem.clone(), self.key_pem.clone())),
        })
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn", &self.alpn)
            .finish_non_exhaustive()
    }
}

/// Build a validated TLS context from the credential files.
///
/// Fails with [`MqttError::Credential`] when a file is missing or does not
/// contain usable PEM material, and with [`MqttError::TlsHandshakeConfig`]
/// when the certificate and private key do not belong together.
pub fn build(credentials: &Credentials) -> MqttResult<TlsContext> {
    let ca_pem = read_pem(&credentials.root_ca, "CA cert")?;
    let cert_pem = read_pem(&credentials.client_cert, "client cert")?;
    let key_pem = read_pem(&credentials.private_key, "client key")?;

    let ca_certs = parse_certs(&ca_pem, &credentials.root_ca, "CA cert")?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).map_err(|e| {
            MqttError::Credential(format!(
                "invalid CA cert '{}': {e}",
                credentials.root_ca.display()
            ))
        })?;
    }

    let client_certs = parse_certs(&cert_pem, &credentials.client_cert, "client cert")?;
    let key = parse_key(&key_pem, &credentials.private_key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| {
            MqttError::Credential(format!(
                "unsupported client key '{}': {e}",
                credentials.private_key.display()
            ))
        })?;
    check_key_pair(
        &CertifiedKey::new(client_certs.clone(), signing_key),
        credentials,
    )?;

    // Only checked for acceptance; the transport is handed the PEM bytes.
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| MqttError::TlsHandshakeConfig(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(client_certs, key)
        .map_err(|e| MqttError::TlsHandshakeConfig(format!("client auth: {e}")))?;

    tracing::debug!(
        cert = %credentials.client_cert.display(),
        ca = %credentials.root_ca.display(),
        "TLS credentials validated"
    );

    Ok(TlsContext {
        ca_pem,
        cert_pem,
        key_pem,
        alpn: None,
    })
}

/// Load the credentials named in `config` and return the TLS transport.
pub fn load_tls_transport(config: &MqttConfig) -> MqttResult<Transport> {
    let context = build(&Credentials::from_config(config))?;
    let context = if config.broker_port == 443 {
        context.with_aws_iot_alpn()
    } else {
        context
    };
    Ok(context.transport())
}

/// Plain TCP transport (for local testing / dev mode).
pub fn plaintext_transport() -> Transport {
    Transport::Tcp
}

fn read_pem(path: &Path, what: &str) -> MqttResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        MqttError::Credential(format!("failed to read {what} '{}': {e}", path.display()))
    })
}

fn parse_certs(pem: &[u8], path: &Path, what: &str) -> MqttResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            MqttError::Credential(format!("failed to parse {what} '{}': {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(MqttError::Credential(format!(
            "no certificates found in {what} '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8], path: &Path) -> MqttResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| {
            MqttError::Credential(format!(
                "failed to parse client key '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| {
            MqttError::Credential(format!(
                "no private key found in client key '{}'",
                path.display()
            ))
        })
}

fn check_key_pair(certified: &CertifiedKey, credentials: &Credentials) -> MqttResult<()> {
    match certified.keys_match() {
        Ok(()) => Ok(()),
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
            Err(MqttError::TlsHandshakeConfig(format!(
                "client cert '{}' does not match private key '{}'",
                credentials.client_cert.display(),
                credentials.private_key.display()
            )))
        }
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            tracing::debug!("key type does not expose its public key, skipping pair check");
            Ok(())
        }
        Err(e) => Err(MqttError::Credential(format!(
            "invalid client cert '{}': {e}",
            credentials.client_cert.display()
        ))),
    }
}
