//! Server-certificate verification for outbound tunnels (`spec.md` §4.2
//! "Server-certificate verification"): trust-store validation and/or a
//! pinned SHA-256 fingerprint, independently togglable.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Verifies the presented chain against the trust store (when `inner` is
/// set) and/or a pinned fingerprint (when `pinned_sha256` is set). Both or
/// neither may be configured, matching `spec.md`'s "Both or neither may be
/// enabled."
#[derive(Debug)]
pub struct PinningVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    pinned_sha256: Option<[u8; 32]>,
}

impl PinningVerifier {
    pub fn new(verify_trust_store: bool, pinned_fingerprint: Option<&str>) -> Result<Self, RustlsError> {
        let inner = if verify_trust_store {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Some(
                WebPkiServerVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| RustlsError::General(e.to_string()))?,
            )
        } else {
            None
        };
        let pinned_sha256 = pinned_fingerprint
            .map(|hex_digest| parse_fingerprint(hex_digest))
            .transpose()
            .map_err(RustlsError::General)?;
        Ok(Self {
            inner,
            pinned_sha256,
        })
    }
}

fn parse_fingerprint(hex_digest: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(hex_digest.replace(':', "")).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|_| "pinned fingerprint must be 32 bytes".to_string())
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        if let Some(pinned) = self.pinned_sha256 {
            let digest: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
            let matches_end_entity = digest == pinned;
            let matches_intermediate = intermediates
                .iter()
                .any(|cert| Sha256::digest(cert.as_ref()).as_slice() == pinned);
            if !matches_end_entity && !matches_intermediate {
                return Err(RustlsError::General(
                    "presented chain does not contain the pinned fingerprint".into(),
                ));
            }
            if self.inner.is_none() {
                return Ok(ServerCertVerified::assertion());
            }
        }
        match &self.inner {
            Some(verifier) => {
                verifier.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        match &self.inner {
            Some(verifier) => verifier.verify_tls12_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        match &self.inner {
            Some(verifier) => verifier.verify_tls13_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(verifier) => verifier.supported_verify_schemes(),
            None => vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::ED25519,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_parses_colon_separated_hex() {
        let hex_digest = "aa:bb:cc:dd".to_string() + &"00".repeat(28);
        assert!(parse_fingerprint(&hex_digest).is_ok());
    }

    #[test]
    fn short_fingerprint_is_rejected() {
        assert!(parse_fingerprint("aabbcc").is_err());
    }
}
