//! TLS configuration assembly for the SSL transport.
//!
//! [`SslOptions`] is the user-facing knob surface; everything here
//! turns it into rustls client/server configs. Nothing in this module
//! touches the network.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tracing::debug;

use crate::error::OrbError;

// ── Options ──────────────────────────────────────────────────────

/// Peer verification is off. Only for tests and closed networks.
pub const VERIFY_NONE: u8 = 0;
/// Verify a certificate when the peer presents one.
pub const VERIFY_OPTIONAL: u8 = 1;
/// Require and verify a peer certificate.
pub const VERIFY_REQUIRED: u8 = 2;

#[derive(Debug, Clone)]
pub struct SslOptions {
    /// 0 = none, 1 = optional, 2 = required.
    pub verify_peer: u8,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Cipher list expression, e.g. `"ALL !(RSA) TLS13_AES_256_GCM_SHA384"`.
    pub ciphers: String,
    /// Accepted protocol versions, e.g. `["TLS1.3"]`.
    pub protocols: Vec<String>,
}

impl Default for SslOptions {
    fn default() -> Self {
        SslOptions {
            verify_peer: VERIFY_REQUIRED,
            cert_file: None,
            key_file: None,
            ca_file: None,
            ciphers: "ALL".to_string(),
            protocols: vec!["TLS1.2".to_string(), "TLS1.3".to_string()],
        }
    }
}

// ── Cipher list expressions ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// Bare token: exact suite name.
    Exact(String),
    /// Parenthesized token: substring of the suite name.
    Substring(String),
}

impl Matcher {
    fn matches(&self, suite: &str) -> bool {
        match self {
            Matcher::Exact(name) => suite.eq_ignore_ascii_case(name),
            Matcher::Substring(pat) => suite.to_ascii_lowercase().contains(&pat.to_ascii_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CipherToken {
    All,
    None,
    Add(Matcher),
    Remove(Matcher),
}

/// Parsed cipher list expression, evaluated left to right: `ALL`,
/// `NONE`, `token`, `!token`, `(pattern)`, `!(pattern)`.
#[derive(Debug, Clone)]
pub struct CipherExpression {
    tokens: Vec<CipherToken>,
}

impl CipherExpression {
    pub fn parse(expr: &str) -> Result<Self, OrbError> {
        let invalid =
            |what: String| OrbError::TlsConfig(format!("invalid cipher expression: {what}"));
        let mut tokens = Vec::new();
        for raw in expr.split_whitespace() {
            let (negated, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            if body.is_empty() {
                return Err(invalid("empty token".to_string()));
            }
            let matcher = if let Some(inner) = body.strip_prefix('(') {
                let inner = inner
                    .strip_suffix(')')
                    .ok_or_else(|| invalid(format!("unclosed pattern `{raw}`")))?;
                if inner.is_empty() {
                    return Err(invalid("empty pattern".to_string()));
                }
                Matcher::Substring(inner.to_string())
            } else if body.contains('(') || body.contains(')') {
                return Err(invalid(format!("stray parenthesis in `{raw}`")));
            } else {
                match (negated, body) {
                    (false, "ALL") => {
                        tokens.push(CipherToken::All);
                        continue;
                    }
                    (false, "NONE") => {
                        tokens.push(CipherToken::None);
                        continue;
                    }
                    (true, "ALL" | "NONE") => {
                        return Err(invalid(format!("`{raw}` cannot be negated")));
                    }
                    _ => Matcher::Exact(body.to_string()),
                }
            };
            tokens.push(if negated {
                CipherToken::Remove(matcher)
            } else {
                CipherToken::Add(matcher)
            });
        }
        if tokens.is_empty() {
            return Err(invalid("no tokens".to_string()));
        }
        Ok(CipherExpression { tokens })
    }

    /// Evaluate against available suite names, returning the selected
    /// names in selection order.
    pub fn evaluate(&self, available: &[&str]) -> Vec<String> {
        let mut selected: Vec<String> = Vec::new();
        for token in &self.tokens {
            match token {
                CipherToken::All => {
                    for suite in available {
                        if !selected.iter().any(|s| s == suite) {
                            selected.push(suite.to_string());
                        }
                    }
                }
                CipherToken::None => selected.clear(),
                CipherToken::Add(matcher) => {
                    for suite in available {
                        if matcher.matches(suite) && !selected.iter().any(|s| s == suite) {
                            selected.push(suite.to_string());
                        }
                    }
                }
                CipherToken::Remove(matcher) => {
                    selected.retain(|s| !matcher.matches(s));
                }
            }
        }
        selected
    }
}

// ── File loading ─────────────────────────────────────────────────

fn open(path: &Path) -> Result<BufReader<File>, OrbError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| OrbError::TlsConfig(format!("cannot open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, OrbError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| OrbError::TlsConfig(format!("bad certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(OrbError::TlsConfig(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, OrbError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| OrbError::TlsConfig(format!("bad key in {}: {e}", path.display())))?
        .ok_or_else(|| OrbError::TlsConfig(format!("no private key in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore, OrbError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| OrbError::TlsConfig(format!("bad ca certificate: {e}")))?;
    }
    Ok(roots)
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>, OrbError> {
    let mut versions = Vec::new();
    for name in names {
        match name.as_str() {
            "TLS1.2" => versions.push(&rustls::version::TLS12),
            "TLS1.3" => versions.push(&rustls::version::TLS13),
            other => {
                return Err(OrbError::TlsConfig(format!(
                    "unsupported protocol version: {other}"
                )));
            }
        }
    }
    if versions.is_empty() {
        return Err(OrbError::TlsConfig("no protocol versions enabled".to_string()));
    }
    Ok(versions)
}

/// Crypto provider restricted to the suites the cipher expression
/// selects.
fn filtered_provider(expr: &CipherExpression) -> Result<CryptoProvider, OrbError> {
    let base = rustls::crypto::aws_lc_rs::default_provider();
    let names: Vec<String> = base
        .cipher_suites
        .iter()
        .map(|s| format!("{:?}", s.suite()))
        .collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let selected = expr.evaluate(&name_refs);
    let cipher_suites: Vec<_> = base
        .cipher_suites
        .iter()
        .zip(&names)
        .filter(|(_, name)| selected.iter().any(|s| s == *name))
        .map(|(suite, _)| *suite)
        .collect();
    if cipher_suites.is_empty() {
        return Err(OrbError::TlsConfig(
            "cipher expression selects no suites".to_string(),
        ));
    }
    debug!(suites = cipher_suites.len(), "cipher suites selected");
    Ok(CryptoProvider {
        cipher_suites,
        ..base
    })
}

// ── Config assembly ──────────────────────────────────────────────

pub fn client_config(options: &SslOptions) -> Result<Arc<ClientConfig>, OrbError> {
    let expr = CipherExpression::parse(&options.ciphers)?;
    let provider = Arc::new(filtered_provider(&expr)?);
    let versions = protocol_versions(&options.protocols)?;

    let roots = match &options.ca_file {
        Some(path) => load_roots(path)?,
        None => RootCertStore::empty(),
    };

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| OrbError::TlsConfig(e.to_string()))?
        .with_root_certificates(roots);

    let mut config = match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| OrbError::TlsConfig(e.to_string()))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(OrbError::TlsConfig(
                "cert file and key file must be set together".to_string(),
            ));
        }
    };

    if options.verify_peer == VERIFY_NONE {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    }

    Ok(Arc::new(config))
}

pub fn server_config(options: &SslOptions) -> Result<Arc<ServerConfig>, OrbError> {
    let expr = CipherExpression::parse(&options.ciphers)?;
    let provider = Arc::new(filtered_provider(&expr)?);
    let versions = protocol_versions(&options.protocols)?;

    let (cert_file, key_file) = match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(OrbError::TlsConfig(
                "server requires cert file and key file".to_string(),
            ));
        }
    };

    let builder = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)
        .map_err(|e| OrbError::TlsConfig(e.to_string()))?;

    let builder = match options.verify_peer {
        VERIFY_NONE => builder.with_no_client_auth(),
        VERIFY_OPTIONAL | VERIFY_REQUIRED => {
            let ca = options.ca_file.as_ref().ok_or_else(|| {
                OrbError::TlsConfig("client verification requires a ca file".to_string())
            })?;
            let roots = Arc::new(load_roots(ca)?);
            let verifier = WebPkiClientVerifier::builder(roots);
            let verifier = if options.verify_peer == VERIFY_OPTIONAL {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier
                .build()
                .map_err(|e| OrbError::TlsConfig(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        other => {
            return Err(OrbError::TlsConfig(format!(
                "invalid verify_peer value: {other}"
            )));
        }
    };

    let config = builder
        .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)
        .map_err(|e| OrbError::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

// ── Verify-nothing verifier ──────────────────────────────────────

/// Accepts any server certificate. Installed only for
/// `verify_peer = 0`; signatures are still checked by the provider.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITES: &[&str] = &[
        "TLS13_AES_256_GCM_SHA384",
        "TLS13_AES_128_GCM_SHA256",
        "TLS13_CHACHA20_POLY1305_SHA256",
        "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    ];

    #[test]
    fn all_selects_everything_in_order() {
        let expr = CipherExpression::parse("ALL").unwrap();
        assert_eq!(expr.evaluate(SUITES), SUITES.to_vec());
    }

    #[test]
    fn tokens_evaluate_left_to_right() {
        let expr = CipherExpression::parse("ALL !(RSA)").unwrap();
        let out = expr.evaluate(SUITES);
        assert!(!out.iter().any(|s| s.contains("RSA")));
        assert_eq!(out.len(), 4);

        // NONE resets; later tokens rebuild.
        let expr = CipherExpression::parse("ALL NONE (CHACHA20)").unwrap();
        assert_eq!(expr.evaluate(SUITES), vec!["TLS13_CHACHA20_POLY1305_SHA256"]);
    }

    #[test]
    fn bare_token_is_exact_pattern_is_substring() {
        let expr = CipherExpression::parse("TLS13_AES_128_GCM_SHA256").unwrap();
        assert_eq!(expr.evaluate(SUITES), vec!["TLS13_AES_128_GCM_SHA256"]);

        // An exact token that is only a substring selects nothing.
        let expr = CipherExpression::parse("AES_128").unwrap();
        assert!(expr.evaluate(SUITES).is_empty());

        let expr = CipherExpression::parse("(aes_128)").unwrap();
        assert_eq!(expr.evaluate(SUITES).len(), 2);
    }

    #[test]
    fn negated_exact_removes_one_suite() {
        let expr = CipherExpression::parse("ALL !TLS13_AES_256_GCM_SHA384").unwrap();
        let out = expr.evaluate(SUITES);
        assert_eq!(out.len(), 4);
        assert!(!out.contains(&"TLS13_AES_256_GCM_SHA384".to_string()));
    }

    #[test]
    fn parse_errors() {
        for bad in ["", "!(unclosed", "!ALL", "!NONE", "!", "stray)paren"] {
            assert!(
                matches!(CipherExpression::parse(bad), Err(OrbError::TlsConfig(_))),
                "expected parse failure for {bad:?}"
            );
        }
    }

    #[test]
    fn provider_filtering_rejects_empty_selection() {
        let expr = CipherExpression::parse("NOSUCHSUITE").unwrap();
        assert!(matches!(
            filtered_provider(&expr),
            Err(OrbError::TlsConfig(_))
        ));
        let expr = CipherExpression::parse("ALL").unwrap();
        assert!(filtered_provider(&expr).is_ok());
    }

    #[test]
    fn protocol_version_mapping() {
        assert!(protocol_versions(&["TLS1.2".to_string(), "TLS1.3".to_string()]).is_ok());
        assert!(protocol_versions(&["SSL3".to_string()]).is_err());
        assert!(protocol_versions(&[]).is_err());
    }

    #[test]
    fn server_config_requires_cert_and_key() {
        let options = SslOptions::default();
        assert!(matches!(server_config(&options), Err(OrbError::TlsConfig(_))));
    }

    #[test]
    fn client_config_rejects_half_configured_identity() {
        let options = SslOptions {
            cert_file: Some("/tmp/cert.pem".into()),
            key_file: None,
            ..Default::default()
        };
        assert!(matches!(client_config(&options), Err(OrbError::TlsConfig(_))));
    }

    #[test]
    fn client_config_without_verification_builds() {
        let options = SslOptions {
            verify_peer: VERIFY_NONE,
            ..Default::default()
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn config_assembly_from_pem_files() {
        let dir = std::env::temp_dir().join(format!("orb-sec-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let options = SslOptions {
            verify_peer: VERIFY_REQUIRED,
            cert_file: Some(cert_path.clone()),
            key_file: Some(key_path),
            ca_file: Some(cert_path),
            ..Default::default()
        };
        assert!(server_config(&options).is_ok());
        assert!(client_config(&options).is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }
}
