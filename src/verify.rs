//! Peer certificate verification.
//!
//! The client side runs in one of two modes. By default no chain
//! validation is performed (the transport trusts its deployment to pin
//! certificates at a higher level). When a verify callback is installed,
//! the chain is validated against the configured roots and the callback
//! gets the final say.
//!
//! Independently of either mode, [`check_cert_hostname`] implements the
//! RFC 6125 name check applied after the handshake when
//! `CheckCertificateHostname` is enabled: SAN DNS entries first, CN as a
//! fallback only when the SAN extension is absent, with a single left-most
//! whole-label wildcard.

use std::sync::Arc;

use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::options::VerifyCallback;

/// What the verify callback gets to look at.
pub struct VerifyContext<'a> {
    /// DER bytes of the end-entity certificate.
    pub end_entity: &'a [u8],
    /// The server name the client asked for.
    pub server_name: String,
    /// Outcome of chain validation against the configured roots.
    pub chain_ok: bool,
}

/// Match `name` against a certificate name template, allowing a single
/// left-most `*` wildcard covering exactly one label.
pub(crate) fn match_domain_name(template: &str, name: &str) -> bool {
    let (template, name) = match template.split_once('.') {
        Some(("*", template_rest)) => match name.split_once('.') {
            Some((_, name_rest)) => (template_rest, name_rest),
            None => return false,
        },
        _ => (template, name),
    };
    !template.is_empty() && template.eq_ignore_ascii_case(name)
}

enum AltNameMatch {
    Found,
    NoMatch,
    NoExtension,
}

fn match_alt_names(cert: &X509Certificate<'_>, hostname: &str) -> AltNameMatch {
    let san = match cert.subject_alternative_name() {
        Ok(Some(san)) => san,
        Ok(None) | Err(_) => return AltNameMatch::NoExtension,
    };

    for name in &san.value.general_names {
        if let GeneralName::DNSName(dns) = name {
            if match_domain_name(dns, hostname) {
                return AltNameMatch::Found;
            }
        }
    }

    AltNameMatch::NoMatch
}

fn match_common_name(cert: &X509Certificate<'_>, hostname: &str) -> bool {
    cert.subject()
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
        .any(|cn| match_domain_name(cn, hostname))
}

/// RFC 6125 hostname check against the peer's end-entity certificate.
pub(crate) fn check_cert_hostname(cert_der: &[u8], hostname: &str) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };

    match match_alt_names(&cert, hostname) {
        AltNameMatch::Found => true,
        AltNameMatch::NoExtension => match_common_name(&cert, hostname),
        AltNameMatch::NoMatch => false,
    }
}

/// Verifier that accepts any presented chain.
///
/// This is the `VERIFY_NONE` default: handshake signatures are still
/// checked, the chain itself is not.
#[derive(Debug)]
pub(crate) struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
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

/// Verifier that validates the chain against the configured roots and
/// hands the outcome to the user callback, which may override it.
pub(crate) struct CallbackServerCert {
    webpki: Arc<WebPkiServerVerifier>,
    callback: VerifyCallback,
}

impl std::fmt::Debug for CallbackServerCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServerCert").finish()
    }
}

impl CallbackServerCert {
    pub(crate) fn new(webpki: Arc<WebPkiServerVerifier>, callback: VerifyCallback) -> Self {
        Self { webpki, callback }
    }
}

impl ServerCertVerifier for CallbackServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain = self.webpki.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let context = VerifyContext {
            end_entity: end_entity.as_ref(),
            server_name: match server_name {
                ServerName::DnsName(dns) => dns.as_ref().to_owned(),
                other => format!("{other:?}"),
            },
            chain_ok: chain.is_ok(),
        };

        if (self.callback)(&context) {
            Ok(ServerCertVerified::assertion())
        } else {
            chain.and(Err(rustls::Error::General(
                "peer rejected by verify callback".into(),
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wildcard_covers_exactly_one_label() {
        assert!(match_domain_name("*.example.com", "a.example.com"));
        assert!(!match_domain_name("*.example.com", "example.com"));
        assert!(!match_domain_name("*.example.com", "a.b.example.com"));
        assert!(match_domain_name("example.com", "example.com"));
        assert!(match_domain_name("EXAMPLE.com", "example.COM"));
        assert!(!match_domain_name("example.com", "other.com"));
        // partial wildcards are not supported
        assert!(!match_domain_name("ww*.example.com", "www.example.com"));
        assert!(!match_domain_name("*", "com"));
    }

    fn san_cert(names: &[&str]) -> Vec<u8> {
        let key = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        key.cert.der().to_vec()
    }

    #[test]
    fn san_match_with_wildcard() {
        let der = san_cert(&["*.example.com"]);
        assert!(check_cert_hostname(&der, "api.example.com"));
        assert!(!check_cert_hostname(&der, "example.com"));
        assert!(!check_cert_hostname(&der, "a.b.example.com"));
    }

    #[test]
    fn san_present_disables_cn_fallback() {
        // CN says example.com, SAN says otherwise; SAN wins.
        let mut params = rcgen::CertificateParams::new(vec!["other.com".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "example.com");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        assert!(!check_cert_hostname(cert.der(), "example.com"));
        assert!(check_cert_hostname(cert.der(), "other.com"));
    }

    #[test]
    fn cn_fallback_without_san() {
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "example.com");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        assert!(check_cert_hostname(cert.der(), "example.com"));
        assert!(!check_cert_hostname(cert.der(), "a.example.com"));
    }
}
