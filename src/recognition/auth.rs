//! Signed connection URLs for the IAT WebSocket endpoint
//!
//! The service authenticates the WebSocket upgrade through query
//! parameters: an HMAC-SHA256 signature over the host, the request date and
//! the request line, keyed by the API secret.
//!
//! ```text
//! host: iat.xf-yun.com
//! date: Thu, 16 Oct 2025 08:30:00 GMT
//! GET /v1 HTTP/1.1
//! ```
//!
//! Signing is a pure function of the credentials, the endpoint constants and
//! the timestamp. The clock is injected so tests can pin it.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use crate::credentials::CredentialSet;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_METHOD: &str = "GET";
const PROTOCOL_VERSION: &str = "HTTP/1.1";
const SIGNATURE_ALGORITHM: &str = "hmac-sha256";
const SIGNED_HEADERS: &str = "host date request-line";

/// RFC 1123 date, the format HTTP uses for the `Date` header
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Source of wall-clock time for request signing
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A connection URL valid for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEndpoint {
    pub url: String,
    /// The HTTP-date the signature is bound to
    pub date: String,
}

impl SignedEndpoint {
    /// URL prefix that is safe to log (the query carries the signature)
    pub fn redacted(&self) -> String {
        match self.url.split_once('?') {
            Some((base, _)) => format!("{}?…", base),
            None => self.url.clone(),
        }
    }
}

/// Signs endpoints for a fixed host and path
pub struct ConnectionAuthenticator {
    host: String,
    path: String,
    clock: Box<dyn Clock>,
}

impl ConnectionAuthenticator {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_clock(host, path, SystemClock)
    }

    pub fn with_clock(
        host: impl Into<String>,
        path: impl Into<String>,
        clock: impl Clock + 'static,
    ) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            clock: Box::new(clock),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Sign a fresh endpoint using the current clock reading
    pub fn sign(&self, credentials: &CredentialSet) -> SignedEndpoint {
        sign_endpoint(credentials, &self.host, &self.path, self.clock.now())
    }
}

/// Build the signed WebSocket URL for one timestamp
pub fn sign_endpoint(
    credentials: &CredentialSet,
    host: &str,
    path: &str,
    now: DateTime<Utc>,
) -> SignedEndpoint {
    let date = now.format(HTTP_DATE_FORMAT).to_string();

    let signature_origin = format!(
        "host: {}\ndate: {}\n{} {} {}",
        host, date, REQUEST_METHOD, path, PROTOCOL_VERSION
    );
    let signature = hmac_sha256_base64(&credentials.api_secret, &signature_origin);

    let authorization_origin = format!(
        "api_key=\"{}\", algorithm=\"{}\", headers=\"{}\", signature=\"{}\"",
        credentials.api_key, SIGNATURE_ALGORITHM, SIGNED_HEADERS, signature
    );
    let authorization = STANDARD.encode(authorization_origin.as_bytes());

    let url = build_url(host, path, &authorization, &date);

    SignedEndpoint { url, date }
}

fn hmac_sha256_base64(secret: &str, message: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(message.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn build_url(host: &str, path: &str, authorization: &str, date: &str) -> String {
    let base = format!("wss://{}{}", host, path);
    match Url::parse(&base) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("authorization", authorization)
                .append_pair("date", date)
                .append_pair("host", host);
            url.to_string()
        }
        Err(e) => {
            // A bad host only surfaces once the connector tries to use the URL.
            log::warn!("Auth: {:?} is not a valid endpoint: {}", base, e);
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("authorization", authorization)
                .append_pair("date", date)
                .append_pair("host", host)
                .finish();
            format!("{}?{}", base, query)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credentials() -> CredentialSet {
        CredentialSet {
            app_id: "app".to_string(),
            api_key: "test-key".to_string(),
            api_secret: "test-secret".to_string(),
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 16, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_http_date_format() {
        let endpoint = sign_endpoint(&credentials(), "iat.xf-yun.com", "/v1", fixed_time());
        assert_eq!(endpoint.date, "Thu, 16 Oct 2025 08:30:00 GMT");
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        let signature = hmac_sha256_base64(
            "test-secret",
            "host: iat.xf-yun.com\ndate: Thu, 16 Oct 2025 08:30:00 GMT\nGET /v1 HTTP/1.1",
        );
        assert_eq!(signature, "aL3OqdM5i6CahW+sMTCPfvj/r9lkJKEwnV/1ezCPHtM=");
    }

    #[test]
    fn test_signed_url_matches_reference_vector() {
        let endpoint = sign_endpoint(&credentials(), "iat.xf-yun.com", "/v1", fixed_time());
        assert_eq!(
            endpoint.url,
            "wss://iat.xf-yun.com/v1?authorization=YXBpX2tleT0idGVzdC1rZXkiLCBhbGdvcml0aG09ImhtYWMtc2hhMjU2IiwgaGVhZGVycz0iaG9zdCBkYXRlIHJlcXVlc3QtbGluZSIsIHNpZ25hdHVyZT0iYUwzT3FkTTVpNkNhaFcrc01UQ1Bmdmovcjlsa0pLRXduVi8xZXpDUEh0TT0i&date=Thu%2C+16+Oct+2025+08%3A30%3A00+GMT&host=iat.xf-yun.com"
        );
    }

    #[test]
    fn test_signing_is_deterministic() {
        let a = ConnectionAuthenticator::with_clock("iat.xf-yun.com", "/v1", FixedClock(fixed_time()));
        let b = ConnectionAuthenticator::with_clock("iat.xf-yun.com", "/v1", FixedClock(fixed_time()));
        assert_eq!(a.sign(&credentials()), b.sign(&credentials()));
        assert_eq!(a.sign(&credentials()), a.sign(&credentials()));
    }

    #[test]
    fn test_new_timestamp_changes_signature() {
        let first = sign_endpoint(&credentials(), "iat.xf-yun.com", "/v1", fixed_time());
        let later = sign_endpoint(
            &credentials(),
            "iat.xf-yun.com",
            "/v1",
            fixed_time() + chrono::Duration::seconds(1),
        );
        assert_ne!(first.url, later.url);
        assert_ne!(first.date, later.date);
    }

    #[test]
    fn test_authorization_embeds_key_not_secret() {
        let endpoint = sign_endpoint(&credentials(), "iat.xf-yun.com", "/v1", fixed_time());
        let url = Url::parse(&endpoint.url).unwrap();
        let authorization = url
            .query_pairs()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let decoded = String::from_utf8(STANDARD.decode(authorization).unwrap()).unwrap();

        assert!(decoded.starts_with("api_key=\"test-key\""));
        assert!(decoded.contains("algorithm=\"hmac-sha256\""));
        assert!(decoded.contains("headers=\"host date request-line\""));
        assert!(!decoded.contains("test-secret"));
    }

    #[test]
    fn test_redacted_hides_query() {
        let endpoint = sign_endpoint(&credentials(), "iat.xf-yun.com", "/v1", fixed_time());
        assert_eq!(endpoint.redacted(), "wss://iat.xf-yun.com/v1?…");
    }
}
