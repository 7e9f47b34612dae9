//! SOAP 1.2 transport with WS-Security UsernameToken and HTTP Digest.

use base64::Engine;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use sha1::{Digest, Sha1};
use tracing::debug;

use ptzcam_core::{Credentials, DeviceError};

use super::xml;
use crate::digest::DigestChallenge;
use crate::DeviceResult;

const ENVELOPE_NAMESPACES: &str = concat!(
    r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:tds="http://www.onvif.org/ver10/device/wsdl" "#,
    r#"xmlns:trt="http://www.onvif.org/ver10/media/wsdl" "#,
    r#"xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl" "#,
    r#"xmlns:timg="http://www.onvif.org/ver20/imaging/wsdl" "#,
    r#"xmlns:tt="http://www.onvif.org/ver10/schema""#,
);

pub(crate) struct SoapTransport {
    http: Client,
    credentials: Credentials,
}

impl SoapTransport {
    pub fn new(http: Client, credentials: Credentials) -> Self {
        Self { http, credentials }
    }

    /// Posts one operation body and returns the response document text.
    /// SOAP faults become [`DeviceError`]s carrying the fault reason.
    pub fn call(&self, url: &str, action: &str, body: &str) -> DeviceResult<String> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope {}>{}<s:Body>{}</s:Body></s:Envelope>"#,
            ENVELOPE_NAMESPACES,
            self.security_header(),
            body
        );

        debug!(url = %url, action = %action, "ONVIF request");
        let build = || {
            self.http
                .post(url)
                .header(CONTENT_TYPE, "application/soap+xml; charset=utf-8")
                .body(envelope.clone())
        };
        let response = send_with_digest(build, "POST", url, &self.credentials)?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| DeviceError::new(format!("{} response read failed: {}", action, e)))?;

        if let Some(reason) = xml::fault_reason(&text) {
            return Err(DeviceError::new(format!("{} fault: {}", action, reason)));
        }
        if !status.is_success() {
            return Err(DeviceError::new(format!("{} failed with status {}", action, status)));
        }
        Ok(text)
    }

    /// Downloads a resource with the session credentials.
    pub fn get_bytes(&self, url: &str, credentials: &Credentials) -> DeviceResult<bytes::Bytes> {
        let response = send_with_digest(|| self.http.get(url), "GET", url, credentials)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::new(format!("GET {} returned {}", url, status)));
        }
        response
            .bytes()
            .map_err(|e| DeviceError::new(format!("GET {} read failed: {}", url, e)))
    }

    fn security_header(&self) -> String {
        if self.credentials.username.is_empty() {
            return String::new();
        }
        let nonce: [u8; 16] = rand::random();
        let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        security_header(&self.credentials.username, self.credentials.password(), &nonce, &created)
    }
}

/// WS-Security UsernameToken with `PasswordDigest = Base64(SHA1(nonce + created + password))`.
fn security_header(username: &str, password: &str, nonce: &[u8], created: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    let digest = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    let nonce = base64::engine::general_purpose::STANDARD.encode(nonce);

    format!(
        concat!(
            r#"<s:Header><Security s:mustUnderstand="1" xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">"#,
            r#"<UsernameToken><Username>{}</Username>"#,
            r#"<Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{}</Password>"#,
            r#"<Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{}</Nonce>"#,
            r#"<Created xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">{}</Created>"#,
            r#"</UsernameToken></Security></s:Header>"#
        ),
        xml::escape(username),
        digest,
        nonce,
        created
    )
}

/// Sends a request; on a `401` carrying a Digest challenge, answers it once.
fn send_with_digest<F>(build: F, method: &str, url: &str, credentials: &Credentials) -> DeviceResult<Response>
where
    F: Fn() -> RequestBuilder,
{
    let response = build()
        .send()
        .map_err(|e| DeviceError::new(format!("request to {} failed: {}", url, e)))?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    let challenge = response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(DigestChallenge::parse);

    let retry = match challenge {
        Some(mut challenge) => {
            let uri = request_uri(url);
            debug!(
                realm = %challenge.realm(),
                opaque = challenge.opaque().is_some(),
                "answering digest challenge"
            );
            let header = challenge.authorization(
                method,
                &uri,
                &credentials.username,
                credentials.password(),
                None,
            )?;
            build().header(AUTHORIZATION, header)
        }
        None => build().basic_auth(&credentials.username, Some(credentials.password())),
    };

    retry
        .send()
        .map_err(|e| DeviceError::new(format!("request to {} failed: {}", url, e)))
}

/// Path and query of `url`, as used in the digest `uri` field.
fn request_uri(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_header_digest() {
        let header = security_header("admin", "testpass", &[0u8; 16], "2024-01-01T00:00:00Z");
        assert!(header.contains("<Username>admin</Username>"));
        assert!(header.contains("PasswordDigest"));
        assert!(header.contains("<Created xmlns="));
        // Base64 of 16 zero bytes.
        assert!(header.contains(">AAAAAAAAAAAAAAAAAAAAAA==</Nonce>"));
    }

    #[test]
    fn test_request_uri() {
        assert_eq!(
            request_uri("http://10.0.0.5/onvif-http/snapshot?Profile_1"),
            "/onvif-http/snapshot?Profile_1"
        );
        assert_eq!(request_uri("http://10.0.0.5:8080/snap.jpg"), "/snap.jpg");
    }
}
