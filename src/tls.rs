//! TLS context construction.
//!
//! Client and server `rustls` configs are built from the process-wide
//! [`HttpsOptions`] plus, for servers and certificate-pinning requests, the
//! `cert=…;key=…` pairs carried in the location userinfo. The client config
//! is built once and shared; a request that pins its own identity gets a
//! private config instead.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::{Arc, Once, OnceLock};

use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::error::Error;
use crate::location::{ClientIdentity, Location};
use crate::options::HttpsOptions;
use crate::verify::{AcceptAnyServerCert, CallbackServerCert};

/// Install the process-wide crypto provider on first use and return it.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
    CryptoProvider::get_default()
        .expect("default crypto provider installed above")
        .clone()
}

/// The shared client config, built from the options at first use.
pub(crate) fn client_config() -> Result<Arc<ClientConfig>, Error> {
    static CONFIG: OnceLock<Result<Arc<ClientConfig>, String>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let options = HttpsOptions::snapshot();
            build_client_config(&options, None)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(Error::message)
}

/// A private client config with the given identity pinned.
pub(crate) fn client_config_for(identity: &ClientIdentity) -> Result<Arc<ClientConfig>, Error> {
    let options = HttpsOptions::snapshot();
    build_client_config(&options, Some(identity)).map(Arc::new)
}

fn build_client_config(
    options: &HttpsOptions,
    identity: Option<&ClientIdentity>,
) -> Result<ClientConfig, Error> {
    let provider = provider();

    let verifier: Arc<dyn ServerCertVerifier> = match &options.verify_callback {
        Some(callback) => {
            let roots = load_roots(options)?;
            let webpki =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(Error::msg("can not build certificate verifier"))?;
            Arc::new(CallbackServerCert::new(webpki, callback.clone()))
        }
        None => Arc::new(AcceptAnyServerCert::new(provider.clone())),
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(Error::msg("unsupported protocol versions (client)"))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let (cert, key) = match identity {
        Some(identity) => (identity.cert.as_deref(), identity.key.as_deref()),
        None => (
            options.client_certificate.as_deref(),
            options.client_private_key.as_deref(),
        ),
    };

    let mut config = match (cert, key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(Path::new(cert))
                .map_err(Error::msg("can not load client certificate chain"))?;
            let key = load_private_key(Path::new(key), || {
                options.client_private_key_password.clone()
            })
            .map_err(Error::msg("can not load client private key"))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(Error::msg("client certificate/key mismatch"))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::message(
                "both certificate and private key must be specified for client",
            ));
        }
    };

    if options.enable_ssl_client_debug {
        config.key_log = Arc::new(rustls::KeyLogFile::new());
        debug!("client tls debug enabled");
    }

    Ok(config)
}

/// Server config for one bind location; identity comes from the userinfo.
pub(crate) fn server_config(location: &Location) -> Result<Arc<ServerConfig>, Error> {
    let identity = location.identity();
    let (Some(cert), Some(key)) = (identity.cert.as_deref(), identity.key.as_deref()) else {
        return Err(Error::message(
            "no certificate or private key is specified for server",
        ));
    };

    let options = HttpsOptions::snapshot();

    let certs = load_certs(Path::new(cert))
        .map_err(Error::msg("can not load server certificate chain"))?;
    let private_key = load_private_key(Path::new(key), || {
        options
            .key_password_callback
            .as_ref()
            .map(|callback| callback(location, cert, key))
    })
    .map_err(Error::msg("can not load server private key"))?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(Error::msg("unsupported protocol versions (server)"))?
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(Error::msg("server certificate/key mismatch"))?;

    if options.enable_ssl_server_debug {
        config.key_log = Arc::new(rustls::KeyLogFile::new());
        debug!("server tls debug enabled");
    }

    Ok(Arc::new(config))
}

fn load_roots(options: &HttpsOptions) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();

    if let Some(ca_file) = &options.ca_file {
        for cert in load_certs(Path::new(ca_file)).map_err(Error::msg("can not load CAFile"))? {
            roots
                .add(cert)
                .map_err(Error::msg("invalid certificate in CAFile"))?;
        }
    }

    if let Some(ca_path) = &options.ca_path {
        let entries =
            std::fs::read_dir(Path::new(ca_path)).map_err(Error::msg("can not read CAPath"))?;
        for entry in entries {
            let entry = entry.map_err(Error::msg("can not read CAPath"))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // Non-certificate files in the directory are skipped.
            let Ok(certs) = load_certs(&path) else {
                continue;
            };
            for cert in certs {
                let _ = roots.add(cert);
            }
        }
    }

    Ok(roots)
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs)
}

/// Load a PEM private key, decrypting passphrase-protected PKCS#8 keys
/// with the password produced by `password`.
fn load_private_key<F>(path: &Path, password: F) -> io::Result<PrivateKeyDer<'static>>
where
    F: FnOnce() -> Option<String>,
{
    let data = std::fs::read(path)?;

    {
        let mut reader = BufReader::new(&data[..]);
        if let Some(key) = rustls_pemfile::private_key(&mut reader)? {
            return Ok(key);
        }
    }

    let (label, der) = pem_rfc7468::decode_vec(&data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if label != "ENCRYPTED PRIVATE KEY" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        ));
    }

    let password = password().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "private key is encrypted and no password is configured",
        )
    })?;

    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let document = encrypted
        .decrypt(password.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        document.as_bytes().to_vec(),
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write as _;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("veranda-test-{}-{name}", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn self_signed() -> (std::path::PathBuf, std::path::PathBuf) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = write_temp("cert.pem", &generated.cert.pem());
        let key = write_temp("key.pem", &generated.key_pair.serialize_pem());
        (cert, key)
    }

    #[test]
    fn server_config_needs_identity() {
        let location = Location::parse("https://localhost:8443/svc").unwrap();
        let err = server_config(&location).unwrap_err();
        assert!(err.to_string().contains("no certificate or private key"));
    }

    #[test]
    fn server_config_from_userinfo() {
        let (cert, key) = self_signed();
        let location = Location::parse(&format!(
            "https://cert={};key={}@localhost:8443/svc",
            cert.display(),
            key.display()
        ))
        .unwrap();
        server_config(&location).unwrap();
    }

    #[test]
    fn client_config_rejects_half_identity() {
        let (cert, _) = self_signed();
        let options = HttpsOptions {
            client_certificate: Some(cert.display().to_string()),
            ..Default::default()
        };
        let err = build_client_config(&options, None).unwrap_err();
        assert!(err.to_string().contains("both certificate and private key"));
    }

    #[test]
    fn client_config_with_identity() {
        let (cert, key) = self_signed();
        let options = HttpsOptions {
            client_certificate: Some(cert.display().to_string()),
            client_private_key: Some(key.display().to_string()),
            ..Default::default()
        };
        build_client_config(&options, None).unwrap();
    }
}
