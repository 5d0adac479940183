//! TLS connector for the TCP transport.

use crate::config::TlsConfig;
use crate::error::SatelliteError;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Builds a connector and the SNI name for `host`.
///
/// Server certificates are checked against the configured CA file, or the
/// webpki roots when none is set. `skip_verify` disables the check entirely.
pub fn create_tls_connector(
    config: &TlsConfig,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), SatelliteError> {
    let client_config = if config.skip_verify {
        tracing::warn!("TLS certificate verification disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::InsecureVerifier))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store(config)?)
            .with_no_client_auth()
    };

    let connector = TlsConnector::from(Arc::new(client_config));
    let name = config.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| SatelliteError::Tls(format!("invalid server name: {}", name)))?;

    Ok((connector, server_name))
}

fn root_store(config: &TlsConfig) -> Result<RootCertStore, SatelliteError> {
    let mut store = RootCertStore::empty();
    match &config.ca_cert_path {
        Some(path) => {
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| SatelliteError::Tls(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SatelliteError> {
    let file = File::open(path).map_err(|e| {
        SatelliteError::Tls(format!("cannot open cert file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SatelliteError::Tls(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(SatelliteError::Tls(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate.
    #[derive(Debug)]
    pub(super) struct InsecureVerifier;

    impl ServerCertVerifier for InsecureVerifier {
        fn verify_server_cert(
            &self,
            _: &CertificateDer<'_>,
            _: &[CertificateDer<'_>],
            _: &ServerName<'_>,
            _: &[u8],
            _: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SatelliteErrorCode;
    use std::io::Write;

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        let err = create_tls_connector(&config, "localhost").err().unwrap();
        assert_eq!(err.code(), SatelliteErrorCode::TlsError);
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let config = TlsConfig {
            ca_cert_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let err = create_tls_connector(&config, "localhost").err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsConfig {
            server_name: Some("sync.example.com".to_string()),
            ..Default::default()
        };
        let (_, name) = create_tls_connector(&config, "10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "sync.example.com");

        let config = TlsConfig {
            skip_verify: true,
            ..Default::default()
        };
        let (_, name) = create_tls_connector(&config, "10.0.0.1").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }
}
