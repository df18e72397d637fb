//! Static HTTP basic authentication.

use base64::Engine;
use url::Url;

use super::AuthProvider;
use crate::protocol::HEADER_AUTHORIZATION;
use crate::{Credential, Error, Operation, Result};

/// Auth provider with a fixed `Authorization: Basic ...` credential.
///
/// Login and password default to the user-info part of the URL.
#[derive(Debug, Clone)]
pub struct BasicAuthProvider {
    auth: Credential,
}

impl BasicAuthProvider {
    /// Create a provider from an LFS endpoint URL, using its user-info.
    pub fn new(href: &Url) -> Result<Self> {
        Self::with_credentials(href, None, None)
    }

    /// Create a provider with explicit login and password.
    ///
    /// Empty or missing values fall back to the URL's user-info.
    pub fn with_credentials(href: &Url, login: Option<&str>, password: Option<&str>) -> Result<Self> {
        let login = match login {
            Some(login) if !login.is_empty() => login.to_string(),
            _ => decode_component(href.username()),
        };
        let password = match password {
            Some(password) if !password.is_empty() => password.to_string(),
            _ => decode_component(href.password().unwrap_or("")),
        };

        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", login, password).as_bytes());

        let auth = Credential::new(endpoint(href)?)
            .with_header(HEADER_AUTHORIZATION, &format!("Basic {}", encoded));
        Ok(BasicAuthProvider { auth })
    }
}

impl AuthProvider for BasicAuthProvider {
    fn get_auth(&self, _operation: Operation) -> Result<Credential> {
        Ok(self.auth.clone())
    }

    fn invalidate_auth(&self, _operation: Operation, _auth: &Credential) {}
}

/// Strip user-info, query and fragment; `git://` is served over HTTPS.
fn endpoint(href: &Url) -> Result<Url> {
    let mut url = if href.scheme() == "git" {
        let rest = &href.as_str()[href.scheme().len()..];
        Url::parse(&format!("https{}", rest))
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", href, e)))?
    } else {
        href.clone()
    };
    url.set_query(None);
    url.set_fragment(None);
    url.set_username("")
        .and_then(|_| url.set_password(None))
        .map_err(|_| Error::InvalidUrl(format!("can't strip credentials from {}", href)))?;
    Ok(url)
}

/// Undo percent-encoding of URL user-info.
fn decode_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let byte = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = byte {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
