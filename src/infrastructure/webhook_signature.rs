//! Verification of identity-provider webhooks signed in the Svix format.

use crate::infrastructure::error::InfraError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SECRET_PREFIX: &str = "whsec_";
const TOLERANCE_SECONDS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy)]
pub struct SignatureHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("WebhookVerifier")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl WebhookVerifier {
    /// Accepts `whsec_<base64>`; a bare base64 secret is tolerated too.
    pub fn from_secret(secret: &str) -> Result<Self, InfraError> {
        let secret = secret.trim();
        let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
        if encoded.is_empty() {
            return Err(InfraError::InvalidConfig(
                "webhook secret must not be empty".to_string(),
            ));
        }
        let key = STANDARD.decode(encoded).map_err(|error| {
            InfraError::InvalidConfig(format!("webhook secret is not valid base64: {error}"))
        })?;
        Ok(Self { key })
    }

    fn mac(&self, headers: &SignatureHeaders<'_>, body: &[u8]) -> Result<HmacSha256, InfraError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|error| InfraError::Signature(format!("invalid hmac key: {error}")))?;
        mac.update(headers.id.as_bytes());
        mac.update(b".");
        mac.update(headers.timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    pub fn sign(&self, headers: &SignatureHeaders<'_>, body: &[u8]) -> Result<String, InfraError> {
        let digest = self.mac(headers, body)?.finalize().into_bytes();
        Ok(format!("v1,{}", STANDARD.encode(digest)))
    }

    pub fn verify(
        &self,
        headers: &SignatureHeaders<'_>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        if headers.id.trim().is_empty()
            || headers.timestamp.trim().is_empty()
            || headers.signature.trim().is_empty()
        {
            return Err(InfraError::Signature("missing svix headers".to_string()));
        }

        let sent_at = headers
            .timestamp
            .trim()
            .parse::<i64>()
            .map_err(|_| InfraError::Signature("svix-timestamp is not a number".to_string()))?;
        if (now.timestamp() - sent_at).abs() > TOLERANCE_SECONDS {
            return Err(InfraError::Signature(
                "svix-timestamp outside tolerance".to_string(),
            ));
        }

        let expected = self.mac(headers, body)?;
        let matched = headers
            .signature
            .split_whitespace()
            .filter_map(|entry| entry.strip_prefix("v1,"))
            .filter_map(|encoded| STANDARD.decode(encoded).ok())
            .any(|candidate| expected.clone().verify_slice(&candidate).is_ok());

        if matched {
            Ok(())
        } else {
            Err(InfraError::Signature(
                "no matching webhook signature".to_string(),
            ))
        }
    }
}
