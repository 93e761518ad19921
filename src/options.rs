//! Process-wide TLS transport options.
//!
//! Options are plain process-wide state, set once before the first
//! connection is made. The string-keyed [`set_option`] mirrors the
//! name-based configuration surface; typed access goes through
//! [`HttpsOptions::modify`] and [`HttpsOptions::snapshot`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;
use crate::location::Location;
use crate::verify::VerifyContext;

/// Custom peer-verification hook; returning `false` fails the handshake.
pub type VerifyCallback = Arc<dyn Fn(&VerifyContext<'_>) -> bool + Send + Sync>;

/// Server-side private-key passphrase hook: `(location, cert_path, key_path)`.
pub type KeyPasswordCallback = Arc<dyn Fn(&Location, &str, &str) -> String + Send + Sync>;

/// TLS options applied to every client and server in the process.
#[derive(Clone, Default)]
pub struct HttpsOptions {
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub client_certificate: Option<String>,
    pub client_private_key: Option<String>,
    pub client_private_key_password: Option<String>,
    pub enable_ssl_server_debug: bool,
    pub enable_ssl_client_debug: bool,
    pub check_certificate_hostname: bool,
    pub verify_callback: Option<VerifyCallback>,
    pub key_password_callback: Option<KeyPasswordCallback>,
}

impl fmt::Debug for HttpsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsOptions")
            .field("ca_file", &self.ca_file)
            .field("ca_path", &self.ca_path)
            .field("client_certificate", &self.client_certificate)
            .field("client_private_key", &self.client_private_key)
            .field("enable_ssl_server_debug", &self.enable_ssl_server_debug)
            .field("enable_ssl_client_debug", &self.enable_ssl_client_debug)
            .field(
                "check_certificate_hostname",
                &self.check_certificate_hostname,
            )
            .field("verify_callback", &self.verify_callback.is_some())
            .field(
                "key_password_callback",
                &self.key_password_callback.is_some(),
            )
            .finish()
    }
}

static OPTIONS: RwLock<Option<HttpsOptions>> = RwLock::new(None);

impl HttpsOptions {
    /// A copy of the current process-wide options.
    pub fn snapshot() -> HttpsOptions {
        OPTIONS.read().clone().unwrap_or_default()
    }

    /// Mutate the process-wide options in place.
    pub fn modify<F>(f: F)
    where
        F: FnOnce(&mut HttpsOptions),
    {
        let mut guard = OPTIONS.write();
        let options = guard.get_or_insert_with(HttpsOptions::default);
        f(options);
    }
}

/// Set a single option by its configuration name.
///
/// Recognized names: `CAFile`, `CAPath`, `ClientCertificate`,
/// `ClientPrivateKey`, `ClientPrivateKeyPassword`, `EnableSslServerDebug`,
/// `EnableSslClientDebug`, `CheckCertificateHostname`. Unknown names are
/// rejected.
pub fn set_option(name: &str, value: &str) -> Result<(), Error> {
    match name {
        "CAFile" => HttpsOptions::modify(|o| o.ca_file = Some(value.to_owned())),
        "CAPath" => HttpsOptions::modify(|o| o.ca_path = Some(value.to_owned())),
        "ClientCertificate" => {
            HttpsOptions::modify(|o| o.client_certificate = Some(value.to_owned()))
        }
        "ClientPrivateKey" => {
            HttpsOptions::modify(|o| o.client_private_key = Some(value.to_owned()))
        }
        "ClientPrivateKeyPassword" => {
            HttpsOptions::modify(|o| o.client_private_key_password = Some(value.to_owned()))
        }
        "EnableSslServerDebug" => {
            let value = parse_bool(name, value)?;
            HttpsOptions::modify(|o| o.enable_ssl_server_debug = value);
        }
        "EnableSslClientDebug" => {
            let value = parse_bool(name, value)?;
            HttpsOptions::modify(|o| o.enable_ssl_client_debug = value);
        }
        "CheckCertificateHostname" => {
            let value = parse_bool(name, value)?;
            HttpsOptions::modify(|o| o.check_certificate_hostname = value);
        }
        _ => return Err(Error::message(format!("unknown option: {name}"))),
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    if value.eq_ignore_ascii_case("true") || value == "1" || value.eq_ignore_ascii_case("yes") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value == "0" || value.eq_ignore_ascii_case("no")
    {
        Ok(false)
    } else {
        Err(Error::message(format!("bad value for {name}: {value}")))
    }
}
