use crate::errors::{AppError, AppResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

const TLS_KEYS: &[&str] = &["sslmode", "ssl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    Unverified,
    Verified,
}

impl TlsMode {
    // Anything not explicitly relaxed verifies certificates.
    pub fn from_connection_string(dsn: &str) -> Self {
        let mut mode = Self::Verified;
        for (key, value) in connection_params(dsn) {
            let value = value.to_ascii_lowercase();
            let parsed = match key.to_ascii_lowercase().as_str() {
                "sslmode" => match value.as_str() {
                    "disable" => Some(Self::Disabled),
                    "allow" | "prefer" | "require" | "no-verify" => Some(Self::Unverified),
                    _ => Some(Self::Verified),
                },
                "ssl" => match value.as_str() {
                    "false" | "0" | "off" | "no" | "disable" => Some(Self::Disabled),
                    "require" | "no-verify" => Some(Self::Unverified),
                    _ => Some(Self::Verified),
                },
                _ => None,
            };
            if let Some(parsed) = parsed {
                mode = parsed;
            }
        }
        mode
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Unverified => "unverified",
            Self::Verified => "verified",
        }
    }

    pub fn client_config(self) -> AppResult<Option<ClientConfig>> {
        if self == Self::Disabled {
            return Ok(None);
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|error| AppError::Config(format!("tls setup failed: {}", error)))?;

        let config = match self {
            Self::Unverified => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth(),
            _ => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };
        Ok(Some(config))
    }
}

pub fn strip_tls_params(dsn: &str) -> String {
    if let Some((base, query)) = dsn.split_once('?') {
        let kept = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !is_tls_key(pair))
            .collect::<Vec<_>>();
        if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        }
    } else if dsn.contains("://") {
        dsn.to_string()
    } else {
        dsn.split_whitespace()
            .filter(|pair| !is_tls_key(pair))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn is_tls_key(pair: &str) -> bool {
    let key = pair.split('=').next().unwrap_or_default().trim();
    TLS_KEYS.iter().any(|candidate| key.eq_ignore_ascii_case(candidate))
}

fn connection_params(dsn: &str) -> Vec<(String, String)> {
    let raw: Vec<&str> = if dsn.contains("://") {
        match dsn.split_once('?') {
            Some((_, query)) => query.split('&').collect(),
            None => Vec::new(),
        }
    } else {
        dsn.split_whitespace().collect()
    };
    raw.into_iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().trim_matches('\'').to_string()))
        .collect()
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::{strip_tls_params, TlsMode};

    #[test]
    fn explicit_disable_turns_tls_off() {
        assert_eq!(
            TlsMode::from_connection_string("postgres://u:p@db:5432/app?sslmode=disable"),
            TlsMode::Disabled
        );
        assert_eq!(
            TlsMode::from_connection_string("postgresql://u:p@db/app?ssl=false"),
            TlsMode::Disabled
        );
        assert_eq!(
            TlsMode::from_connection_string("host=db user=u sslmode=disable"),
            TlsMode::Disabled
        );
    }

    #[test]
    fn require_encrypts_without_verification() {
        assert_eq!(
            TlsMode::from_connection_string("postgres://u:p@db/app?application_name=x&sslmode=require"),
            TlsMode::Unverified
        );
        assert_eq!(
            TlsMode::from_connection_string("postgres://u:p@db/app?sslmode=REQUIRE"),
            TlsMode::Unverified
        );
        assert_eq!(
            TlsMode::from_connection_string("host=db sslmode='prefer'"),
            TlsMode::Unverified
        );
    }

    #[test]
    fn everything_else_verifies_certificates() {
        assert_eq!(TlsMode::from_connection_string("postgres://u:p@db/app"), TlsMode::Verified);
        assert_eq!(
            TlsMode::from_connection_string("postgres://u:p@db/app?sslmode=verify-full"),
            TlsMode::Verified
        );
        assert_eq!(
            TlsMode::from_connection_string("postgres://u:p@db/app?sslmode=bogus"),
            TlsMode::Verified
        );
        assert_eq!(TlsMode::from_connection_string("host=db user=u"), TlsMode::Verified);
        assert_eq!(TlsMode::from_connection_string("postgres://u:p@db/app?ssl=true"), TlsMode::Verified);
        assert_eq!(TlsMode::from_connection_string("postgres://u:p@db/app?ssl=1"), TlsMode::Verified);
        assert_eq!(
            TlsMode::from_connection_string("postgres://u:p@db/app?ssl=require"),
            TlsMode::Unverified
        );
    }

    #[test]
    fn tls_params_are_stripped_before_driver_parse() {
        assert_eq!(
            strip_tls_params("postgres://u:p@db/app?sslmode=verify-full&application_name=bot"),
            "postgres://u:p@db/app?application_name=bot"
        );
        assert_eq!(strip_tls_params("postgres://u:p@db/app?sslmode=require"), "postgres://u:p@db/app");
        assert_eq!(strip_tls_params("host=db sslmode=disable user=u"), "host=db user=u");
    }

    #[test]
    fn client_config_matches_mode() {
        assert!(TlsMode::Disabled.client_config().expect("config").is_none());
        assert!(TlsMode::Unverified.client_config().expect("config").is_some());
        assert!(TlsMode::Verified.client_config().expect("config").is_some());
    }
}
