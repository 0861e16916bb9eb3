use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::Url;
use sha1::Sha1;

use crate::error::SessionError;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";
pub const OAUTH_VERSION: &str = "1.0";

type HmacSha1 = Hmac<Sha1>;

/// Process-wide application credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsumerCredentials {
    pub key: String,
    pub secret: String,
}

impl fmt::Debug for ConsumerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerCredentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One user's access token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredentials {
    pub token: String,
    pub secret: String,
}

impl fmt::Debug for AccessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredentials")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Builds the OAuth 1.0a (HMAC-SHA1) `Authorization` header value for one
/// request with a fresh nonce and the current timestamp.
pub fn authorization_header(
    method: &str,
    url: &Url,
    params: &[(String, String)],
    consumer: &ConsumerCredentials,
    access: &AccessCredentials,
) -> Result<String, SessionError> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SessionError::Configuration("system clock is before UNIX_EPOCH".to_string()))?
        .as_secs();
    signed_authorization_header(
        method,
        url,
        params,
        consumer,
        access,
        &generate_nonce(),
        timestamp,
    )
}

pub fn signed_authorization_header(
    method: &str,
    url: &Url,
    params: &[(String, String)],
    consumer: &ConsumerCredentials,
    access: &AccessCredentials,
    nonce: &str,
    timestamp: u64,
) -> Result<String, SessionError> {
    let mut oauth_params = vec![
        ("oauth_consumer_key".to_string(), consumer.key.clone()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        (
            "oauth_signature_method".to_string(),
            SIGNATURE_METHOD.to_string(),
        ),
        ("oauth_timestamp".to_string(), timestamp.to_string()),
        ("oauth_token".to_string(), access.token.clone()),
        ("oauth_version".to_string(), OAUTH_VERSION.to_string()),
    ];

    let mut signed_params = Vec::with_capacity(params.len() + oauth_params.len());
    signed_params.extend(
        url.query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned())),
    );
    signed_params.extend(params.iter().cloned());
    signed_params.extend(oauth_params.iter().cloned());

    let base = signature_base_string(method, url, &signed_params);
    let signature = sign(&base, &consumer.secret, &access.secret)?;
    oauth_params.push(("oauth_signature".to_string(), signature));
    oauth_params.sort();

    let rendered = oauth_params
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("OAuth {rendered}"))
}

pub fn signature_base_string(method: &str, url: &Url, params: &[(String, String)]) -> String {
    let mut encoded = params
        .iter()
        .map(|(key, value)| (percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>();
    encoded.sort();
    let normalized = encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(&base_string_uri(url)),
        percent_encode(&normalized)
    )
}

/// Scheme and host lowercased, default port dropped, query and fragment removed.
pub fn base_string_uri(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let port = url.port().map(|port| format!(":{port}")).unwrap_or_default();
    format!("{scheme}://{host}{port}{}", url.path())
}

/// RFC 3986 encoding: everything except `A-Z a-z 0-9 - . _ ~`.
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn sign(base: &str, consumer_secret: &str, token_secret: &str) -> Result<String, SessionError> {
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|error| SessionError::Configuration(format!("invalid signing key: {error}")))?;
    mac.update(base.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn generate_nonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use reqwest::Url;

    use super::{
        AccessCredentials, ConsumerCredentials, authorization_header, base_string_uri,
        generate_nonce, percent_encode, signature_base_string, signed_authorization_header,
    };

    fn reference_consumer() -> ConsumerCredentials {
        ConsumerCredentials {
            key: "xvz1evFS4wEEPTGEFPHBog".to_string(),
            secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".to_string(),
        }
    }

    fn reference_access() -> AccessCredentials {
        AccessCredentials {
            token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".to_string(),
        }
    }

    fn reference_body() -> Vec<(String, String)> {
        vec![(
            "status".to_string(),
            "Hello Ladies + Gentlemen, a signed OAuth request!".to_string(),
        )]
    }

    #[test]
    fn percent_encoding_keeps_only_unreserved_characters() {
        assert_eq!(percent_encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(percent_encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(percent_encode("User:Example/Sandbox"), "User%3AExample%2FSandbox");
        assert_eq!(percent_encode("☃"), "%E2%98%83");
    }

    #[test]
    fn base_string_uri_normalizes_scheme_host_and_port() {
        let url = Url::parse("HTTPS://Meta.Wikimedia.ORG:443/w/api.php?action=query").expect("url");
        assert_eq!(base_string_uri(&url), "https://meta.wikimedia.org/w/api.php");

        let url = Url::parse("http://localhost:8080/w/api.php").expect("url");
        assert_eq!(base_string_uri(&url), "http://localhost:8080/w/api.php");
    }

    #[test]
    fn base_string_matches_reference_request() {
        let url = Url::parse("https://api.twitter.com/1.1/statuses/update.json").expect("url");
        let mut params = reference_body();
        params.extend([
            ("include_entities".to_string(), "true".to_string()),
            ("oauth_consumer_key".to_string(), "xvz1evFS4wEEPTGEFPHBog".to_string()),
            (
                "oauth_nonce".to_string(),
                "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg".to_string(),
            ),
            ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
            ("oauth_timestamp".to_string(), "1318622958".to_string()),
            (
                "oauth_token".to_string(),
                "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            ),
            ("oauth_version".to_string(), "1.0".to_string()),
        ]);

        let base = signature_base_string("post", &url, &params);
        assert_eq!(
            base,
            "POST&https%3A%2F%2Fapi.twitter.com%2F1.1%2Fstatuses%2Fupdate.json&include_entities%3Dtrue%26oauth_consumer_key%3Dxvz1evFS4wEEPTGEFPHBog%26oauth_nonce%3DkYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg%26oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1318622958%26oauth_token%3D370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb%26oauth_version%3D1.0%26status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"
        );
    }

    #[test]
    fn header_signature_matches_reference_request() {
        let url = Url::parse("https://api.twitter.com/1.1/statuses/update.json?include_entities=true")
            .expect("url");
        let header = signed_authorization_header(
            "POST",
            &url,
            &reference_body(),
            &reference_consumer(),
            &reference_access(),
            "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg",
            1_318_622_958,
        )
        .expect("sign");

        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\", "));
        assert!(header.contains("oauth_signature=\"tnnArxj06cWHq44gCs1OSKk%2FjLY%3D\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA1\""));
        assert!(header.ends_with("oauth_version=\"1.0\""));
        assert!(!header.contains("LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE"));
    }

    #[test]
    fn different_token_secrets_produce_different_signatures() {
        let url = Url::parse("https://meta.wikimedia.org/w/api.php").expect("url");
        let params = vec![("action".to_string(), "query".to_string())];
        let mut other = reference_access();
        other.secret = "another-secret".to_string();

        let first = signed_authorization_header(
            "GET",
            &url,
            &params,
            &reference_consumer(),
            &reference_access(),
            "nonce",
            1,
        )
        .expect("sign");
        let second =
            signed_authorization_header("GET", &url, &params, &reference_consumer(), &other, "nonce", 1)
                .expect("sign");
        assert_ne!(first, second);
    }

    #[test]
    fn fresh_headers_use_fresh_nonces() {
        let url = Url::parse("https://meta.wikimedia.org/w/api.php").expect("url");
        let first =
            authorization_header("GET", &url, &[], &reference_consumer(), &reference_access())
                .expect("sign");
        let second =
            authorization_header("GET", &url, &[], &reference_consumer(), &reference_access())
                .expect("sign");
        assert_ne!(first, second);

        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 22);
        assert!(
            nonce
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?} {:?}", reference_consumer(), reference_access());
        assert!(!rendered.contains("kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw"));
        assert!(!rendered.contains("LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE"));
        assert!(!rendered.contains("370773112"));
    }
}
