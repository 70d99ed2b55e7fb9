//! OAuth token refresh and personal access token rotation.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::GitError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of exchanging a refresh token.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// OAuth client credentials.
#[derive(Clone, Default)]
pub struct OAuthCredentials {
    pub provider_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Token operations against the git hosting provider.
pub trait OAuthClient: Send + Sync {
    /// Exchange a refresh token for a new access token.
    ///
    /// A revoked or expired refresh token is [`GitError::InvalidGrant`].
    fn refresh_access_token(
        &self,
        credentials: &OAuthCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, GitError>;

    /// Rotate the user's personal access token and return the new one.
    fn rotate_personal_token(
        &self,
        credentials: &OAuthCredentials,
        access_token: &str,
    ) -> Result<String, GitError>;
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitLabUser {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct PersonalToken {
    id: u64,
    #[serde(default)]
    token: Option<String>,
}

/// GitLab implementation using its REST API.
pub struct GitLabOAuth {
    client: reqwest::blocking::Client,
}

impl GitLabOAuth {
    pub fn new() -> Result<Self, GitError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GitError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn api(&self, credentials: &OAuthCredentials, path: &str) -> String {
        format!("{}/api/v4{}", credentials.provider_url.trim_end_matches('/'), path)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, access_token: &str) -> Result<T, GitError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .map_err(|e| GitError::Http(format!("GET {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(GitError::Http(format!("GET {} returned {}", url, response.status())));
        }
        response
            .json()
            .map_err(|e| GitError::Http(format!("GET {} returned invalid JSON: {}", url, e)))
    }
}

impl OAuthClient for GitLabOAuth {
    fn refresh_access_token(
        &self,
        credentials: &OAuthCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, GitError> {
        let url = format!("{}/oauth/token", credentials.provider_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .map_err(|e| GitError::Http(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| GitError::Http(format!("POST {} body: {}", url, e)))?;
        if !status.is_success() {
            return Err(token_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| GitError::Http(format!("invalid token response: {}", e)))
    }

    fn rotate_personal_token(
        &self,
        credentials: &OAuthCredentials,
        access_token: &str,
    ) -> Result<String, GitError> {
        let user: GitLabUser = self.get_json(&self.api(credentials, "/user"), access_token)?;
        let tokens: Vec<PersonalToken> = self.get_json(
            &self.api(
                credentials,
                &format!("/personal_access_tokens?revoked=false&user_id={}", user.id),
            ),
            access_token,
        )?;
        let current = tokens
            .first()
            .ok_or_else(|| GitError::Http(format!("no personal access token for user {}", user.id)))?;
        debug!(user_id = user.id, token_id = current.id, "rotating personal access token");

        let url = self.api(credentials, &format!("/personal_access_tokens/{}/rotate", current.id));
        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .map_err(|e| GitError::Http(format!("POST {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "personal access token rotation refused");
            return Err(GitError::Http(format!("POST {} returned {}", url, response.status())));
        }
        let rotated: PersonalToken = response
            .json()
            .map_err(|e| GitError::Http(format!("invalid rotate response: {}", e)))?;
        rotated
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GitError::Http("rotate response carried no token".to_string()))
    }
}

/// Map an OAuth error body onto [`GitError`].
pub fn token_error(status: u16, body: &str) -> GitError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            GitError::InvalidGrant(err.error_description.unwrap_or(err.error))
        }
        Ok(err) => GitError::Auth(format!(
            "{}: {}",
            err.error,
            err.error_description.unwrap_or_default()
        )),
        Err(_) => GitError::Http(format!("token endpoint returned {}", status)),
    }
}
