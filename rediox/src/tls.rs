//! TLS transport upgrade for `rediss://` targets.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::errors::{ErrorKind, RedioxResult};

/// Upgrades an established TCP stream to TLS against `host`.
pub(crate) async fn wrap_tls(
    host: &str,
    tcp: TcpStream,
    insecure: bool,
) -> RedioxResult<TlsStream<TcpStream>> {
    let config = client_config(insecure)?;
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| {
            crate::errors::Error::from((
                ErrorKind::InvalidClientConfig,
                "Host is not a valid TLS server name",
                host.to_string(),
            ))
        })?;
    Ok(connector.connect(server_name, tcp).await?)
}

fn client_config(insecure: bool) -> RedioxResult<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?
    {
        // certificates the platform store cannot parse are skipped
        let _ = roots.add(cert);
    }
    #[cfg(feature = "tls-rustls-webpki-roots")]
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    #[allow(unused_mut)]
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if insecure {
        #[cfg(feature = "tls-rustls-insecure")]
        {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoCertificateVerification(
                    rustls::crypto::ring::default_provider(),
                )));
        }
        #[cfg(not(feature = "tls-rustls-insecure"))]
        fail!((
            ErrorKind::InvalidClientConfig,
            "Certificate verification can only be disabled with the tls-rustls-insecure feature"
        ));
    }
    Ok(config)
}

#[cfg(feature = "tls-rustls-insecure")]
mod danger {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    pub(super) struct NoCertificateVerification(pub CryptoProvider);

    impl ServerCertVerifier for NoCertificateVerification {
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
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
