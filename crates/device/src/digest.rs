//! HTTP Digest access authentication (RFC 2617 / RFC 7616) on top of
//! `digest_auth`.

use digest_auth::{AuthContext, WwwAuthenticateHeader};

use ptzcam_core::DeviceError;

use crate::DeviceResult;

/// A parsed `WWW-Authenticate: Digest ...` challenge.
pub(crate) struct DigestChallenge {
    prompt: WwwAuthenticateHeader,
}

impl DigestChallenge {
    /// `None` for non-Digest schemes and malformed challenges.
    pub fn parse(header: &str) -> Option<Self> {
        digest_auth::parse(header.trim())
            .ok()
            .map(|prompt| Self { prompt })
    }

    pub fn realm(&self) -> &str {
        &self.prompt.realm
    }

    pub fn opaque(&self) -> Option<&str> {
        self.prompt.opaque.as_deref()
    }

    /// Builds the `Authorization` header value for one request.
    ///
    /// `cnonce` is generated when not given.
    pub fn authorization(
        &mut self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: Option<&str>,
    ) -> DeviceResult<String> {
        let mut context = if method.eq_ignore_ascii_case("POST") {
            AuthContext::new_post(username, password, uri, None::<&[u8]>)
        } else {
            AuthContext::new(username, password, uri)
        };
        if let Some(cnonce) = cnonce {
            context.set_custom_cnonce(cnonce);
        }
        let answer = self
            .prompt
            .respond(&context)
            .map_err(|e| DeviceError::new(format!("digest challenge not answerable: {}", e)))?;
        Ok(answer.to_header_string())
    }
}
