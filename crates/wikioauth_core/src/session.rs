use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{Method, Url};
use serde_json::Value;
use tracing::debug;

use crate::config::ResolvedSettings;
use crate::credentials::{CredentialStore, token_fingerprint};
use crate::error::SessionError;
use crate::oauth::{self, AccessCredentials, ConsumerCredentials};

/// Script path prefix used by Wikimedia-hosted wikis.
pub const API_PATH: &str = "/w/";

/// One authenticated request/response exchange with `api.php`.
pub trait WikiApi {
    fn get(&mut self, params: &[(&str, String)]) -> Result<Value, SessionError>;
    fn post(&mut self, params: &[(&str, String)]) -> Result<Value, SessionError>;
    /// Application identity the session acts for.
    fn identity(&self) -> &str;
    /// Display name stored alongside the credential, if any.
    fn cached_username(&self) -> Option<&str>;

    fn csrf_token(&mut self) -> Result<String, SessionError> {
        let response = self.get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        parse_csrf_token(&response)
    }
}

/// Anything that can hand out a fresh, exclusively owned session for a user.
pub trait SessionSource {
    type Session: WikiApi;

    fn open_session(&self, identity: &str) -> Result<Self::Session, SessionError>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub provider: String,
    pub wiki_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub consumer: Option<ConsumerCredentials>,
}

impl SessionSettings {
    pub fn from_resolved(settings: &ResolvedSettings) -> Self {
        let consumer = match (&settings.consumer_key, &settings.consumer_secret) {
            (Some(key), Some(secret)) => Some(ConsumerCredentials {
                key: key.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        };
        Self {
            provider: settings.provider.clone(),
            wiki_url: settings.wiki_url.clone(),
            user_agent: settings.user_agent.clone(),
            timeout_ms: settings.timeout_ms,
            consumer,
        }
    }
}

/// One user's authenticated connection to `api.php`. Owns its own HTTP
/// client and exactly one OAuth token pair.
pub struct ClientSession {
    identity: String,
    provider: String,
    scheme: String,
    host: String,
    api_url: Url,
    consumer: ConsumerCredentials,
    access: AccessCredentials,
    cached_username: Option<String>,
    client: Client,
    csrf_token: Option<String>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("identity", &self.identity)
            .field("provider", &self.provider)
            .field("api_url", &self.api_url.as_str())
            .field("consumer_key", &self.consumer.key)
            .field("token_fingerprint", &self.token_fingerprint())
            .field("cached_username", &self.cached_username)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name, with the port when it is not the scheme default.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api_path(&self) -> &str {
        API_PATH
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn token_fingerprint(&self) -> String {
        token_fingerprint(&self.access.token)
    }

    #[cfg(test)]
    pub(crate) fn access(&self) -> &AccessCredentials {
        &self.access
    }

    fn send(&mut self, method: Method, params: &[(&str, String)]) -> Result<Value, SessionError> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        pairs.extend(
            params
                .iter()
                .map(|(key, value)| ((*key).to_string(), value.clone())),
        );

        let authorization = oauth::authorization_header(
            method.as_str(),
            &self.api_url,
            &pairs,
            &self.consumer,
            &self.access,
        )?;
        let request = if method == Method::POST {
            self.client.post(self.api_url.clone()).form(&pairs)
        } else {
            self.client.get(self.api_url.clone()).query(&pairs)
        };

        let response = request
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "MediaWiki API request failed with HTTP {status}"
            )));
        }

        let payload: Value = response.json().map_err(|error| {
            SessionError::Transport(format!(
                "failed to decode MediaWiki API JSON response: {error}"
            ))
        })?;
        check_api_error(&payload)?;
        Ok(payload)
    }
}

impl WikiApi for ClientSession {
    fn get(&mut self, params: &[(&str, String)]) -> Result<Value, SessionError> {
        self.send(Method::GET, params)
    }

    fn post(&mut self, params: &[(&str, String)]) -> Result<Value, SessionError> {
        self.send(Method::POST, params)
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn cached_username(&self) -> Option<&str> {
        self.cached_username.as_deref()
    }

    fn csrf_token(&mut self) -> Result<String, SessionError> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let token = parse_csrf_token(&response)?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

/// Turns stored credentials into sessions. Holds only the store and
/// immutable settings; every [`SessionFactory::build_session`] call yields a
/// brand new [`ClientSession`].
#[derive(Debug)]
pub struct SessionFactory<S> {
    store: S,
    settings: SessionSettings,
}

impl<S: CredentialStore> SessionFactory<S> {
    pub fn new(store: S, settings: SessionSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn build_session(
        &self,
        identity: &str,
        provider: &str,
        target_base_url: &str,
    ) -> Result<ClientSession, SessionError> {
        let record = self
            .store
            .lookup(identity, provider)
            .map_err(|error| SessionError::CredentialStore(format!("{error:#}")))?
            .ok_or_else(|| SessionError::CredentialNotFound {
                identity: identity.to_string(),
                provider: provider.to_string(),
            })?;

        let (Some(token), Some(secret)) = (record.access_token(), record.access_token_secret())
        else {
            return Err(SessionError::IncompleteCredential {
                identity: identity.to_string(),
                provider: provider.to_string(),
            });
        };

        let consumer = self.settings.consumer.clone().ok_or_else(|| {
            SessionError::Configuration(
                "OAuth consumer key/secret are not configured (MEDIAWIKI_CONSUMER_KEY, MEDIAWIKI_CONSUMER_SECRET)"
                    .to_string(),
            )
        })?;

        let (scheme, host, api_url) = resolve_api_endpoint(target_base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_millis(self.settings.timeout_ms))
            .user_agent(self.settings.user_agent.clone())
            .build()
            .map_err(|error| {
                SessionError::Configuration(format!("failed to build MediaWiki HTTP client: {error}"))
            })?;

        debug!(identity, provider, host = %host, "built per-user MediaWiki session");

        Ok(ClientSession {
            identity: identity.to_string(),
            provider: provider.to_string(),
            scheme,
            host,
            api_url,
            consumer,
            access: AccessCredentials {
                token: token.trim().to_string(),
                secret: secret.trim().to_string(),
            },
            cached_username: record.display_name().map(ToString::to_string),
            client,
            csrf_token: None,
        })
    }
}

impl<S: CredentialStore> SessionSource for SessionFactory<S> {
    type Session = ClientSession;

    fn open_session(&self, identity: &str) -> Result<ClientSession, SessionError> {
        self.build_session(identity, &self.settings.provider, &self.settings.wiki_url)
    }
}

/// Returns `(scheme, host[:port], api.php URL)` for a wiki base URL.
pub fn resolve_api_endpoint(target_base_url: &str) -> Result<(String, String, Url), SessionError> {
    let parsed = Url::parse(target_base_url.trim()).map_err(|error| {
        SessionError::Configuration(format!("invalid wiki URL {target_base_url:?}: {error}"))
    })?;
    let scheme = parsed.scheme().to_string();
    if scheme != "http" && scheme != "https" {
        return Err(SessionError::Configuration(format!(
            "unsupported wiki URL scheme {scheme:?} in {target_base_url:?}"
        )));
    }
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| {
            SessionError::Configuration(format!("wiki URL {target_base_url:?} has no host"))
        })?;
    let host = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let api_url = Url::parse(&format!("{scheme}://{host}{API_PATH}api.php")).map_err(|error| {
        SessionError::Configuration(format!("failed to build api.php URL for {host}: {error}"))
    })?;
    Ok((scheme, host, api_url))
}

/// Maps a MediaWiki `{"error": {...}}` envelope to [`SessionError::RemoteApi`].
pub fn check_api_error(payload: &Value) -> Result<(), SessionError> {
    let Some(error) = payload.get("error") else {
        return Ok(());
    };
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    Err(SessionError::remote(code, info))
}

pub fn parse_csrf_token(response: &Value) -> Result<String, SessionError> {
    response
        .get("query")
        .and_then(|query| query.get("tokens"))
        .and_then(|tokens| tokens.get("csrftoken"))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| SessionError::remote("notoken", "failed to get MediaWiki csrf token"))
}
