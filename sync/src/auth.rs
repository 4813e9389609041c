//! Authentication against the remote document server.

use reqwest::RequestBuilder;
use std::fmt;
use std::sync::Arc;

/// Produces the current bearer token. Called before every request so a
/// refreshed token is picked up without restarting replication.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// How requests to the remote are authenticated.
#[derive(Clone, Default)]
pub enum Credentials {
    /// No `Authorization` header
    #[default]
    None,
    /// `Authorization: Basic ...`
    Basic { username: String, password: String },
    /// `Authorization: Bearer ...` from a provider
    Bearer(TokenProvider),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer<F>(provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Credentials::Bearer(Arc::new(provider))
    }

    /// A bearer token that never changes.
    pub fn static_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self::bearer(move || Some(token.clone()))
    }

    /// Attach the `Authorization` header to a request.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::Bearer(provider) => match provider() {
                Some(token) => request.bearer_auth(token),
                None => {
                    tracing::warn!("Token provider returned no token, sending unauthenticated request");
                    request
                }
            },
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Bearer(_) => f.write_str("Bearer(<provider>)"),
        }
    }
}
