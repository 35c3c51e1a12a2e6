//! TLS trust-store construction for the broker session.
//!
//! The trust store starts from the embedded webpki root bundle and adds
//! any user-supplied CA certificate in PEM form. Skip-verify installs a
//! verifier that accepts every certificate; it exists for lab brokers
//! with self-signed chains and must never reach production.

use edgelink_core::config::TlsSettings;
use edgelink_core::error::{Error, Result};
use rumqttc::TlsConfiguration;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::debug;

/// Build the rumqttc TLS configuration from the agent's TLS settings.
pub fn tls_configuration(settings: &TlsSettings) -> Result<TlsConfiguration> {
    let config = if settings.skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(trust_store(settings)?)
            .with_no_client_auth()
    };
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// The embedded roots plus the user CA file, when configured.
fn trust_store(settings: &TlsSettings) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if !settings.ca_cert.is_empty() {
        let file = File::open(&settings.ca_cert).map_err(|e| {
            Error::config(format!(
                "failed to open CA certificate {}: {e}",
                settings.ca_cert
            ))
        })?;
        let mut reader = BufReader::new(file);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                Error::config(format!(
                    "failed to parse CA certificate {}: {e}",
                    settings.ca_cert
                ))
            })?;
            store
                .add(cert)
                .map_err(|e| Error::config(format!("rejected CA certificate: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::config(format!(
                "no certificates found in {}",
                settings.ca_cert
            )));
        }
        debug!("added {added} CA certificate(s) from {}", settings.ca_cert);
    }

    Ok(store)
}

/// Certificate verifier that accepts everything (skip-verify mode).
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_trust_store_builds() {
        let settings = TlsSettings::default();
        assert!(tls_configuration(&settings).is_ok());
    }

    #[test]
    fn test_skip_verify_builds() {
        let settings = TlsSettings {
            skip_verify: true,
            ..Default::default()
        };
        assert!(tls_configuration(&settings).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let settings = TlsSettings {
            ca_cert: "/nonexistent/ca.pem".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            tls_configuration(&settings),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_ca_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let settings = TlsSettings {
            ca_cert: file.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(tls_configuration(&settings).is_err());
    }
}
