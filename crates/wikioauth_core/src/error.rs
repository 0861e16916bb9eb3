use thiserror::Error;

/// Failures raised while turning a stored credential into an API session or
/// while talking to the wiki API through one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("no {provider} OAuth credentials found for user {identity}")]
    CredentialNotFound { identity: String, provider: String },
    #[error("OAuth access token or secret is missing from {provider} credentials of user {identity}")]
    IncompleteCredential { identity: String, provider: String },
    #[error("MediaWiki API error [{code}]: {info}")]
    RemoteApi { code: String, info: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("credential store error: {0}")]
    CredentialStore(String),
}

impl SessionError {
    pub fn remote(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self::RemoteApi {
            code: code.into(),
            info: info.into(),
        }
    }

    /// Stable short label, used in logs and CLI output.
    pub fn category(&self) -> &'static str {
        match self {
            Self::CredentialNotFound { .. } => "authorization",
            Self::IncompleteCredential { .. } | Self::CredentialStore(_) => "credential",
            Self::RemoteApi { .. } => "remote",
            Self::Transport(_) => "transport",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Failures produced by the remote call itself rather than by local setup.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::RemoteApi { .. } | Self::Transport(_))
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
