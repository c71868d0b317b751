// SPDX-License-Identifier: MIT OR Apache-2.0
//! GitHub App forge client: installation-token exchange, issue reads and
//! writes, and draft pull requests. Error codes are stable `GITHUB_*`
//! strings because they flow verbatim into `failure_reason`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gaffer_config::Settings;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const API_ROOT: &str = "https://api.github.com";
const USER_AGENT: &str = "gaffer/0.1.0";

/// An issue as the core needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeIssue {
    /// Issue number.
    pub number: i64,
    /// Title.
    pub title: String,
    /// Body text (empty when absent).
    pub body: String,
    /// Browser URL.
    pub html_url: String,
}

/// Errors from the forge. `Display` yields the stable failure code.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// A repository slug was not `owner/name`.
    #[error("INVALID_REPO_SLUG: {0}")]
    InvalidRepoSlug(String),

    /// App id / installation id / private key missing.
    #[error("GITHUB_APP_CONFIG_MISSING: {0}")]
    ConfigMissing(String),

    /// The app JWT could not be signed.
    #[error("GITHUB_APP_JWT_FAILED: {0}")]
    Jwt(String),

    /// The installation-token exchange failed.
    #[error("GITHUB_INSTALLATION_TOKEN_FAILED: {status} {body}")]
    InstallationToken {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The installation-token response was missing fields.
    #[error("GITHUB_INSTALLATION_TOKEN_INVALID_RESPONSE")]
    InstallationTokenInvalid,

    /// Reading an issue failed.
    #[error("GITHUB_GET_ISSUE_FAILED: {status} {body}")]
    GetIssue {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Creating an issue failed.
    #[error("GITHUB_CREATE_ISSUE_FAILED: {status} {body}")]
    CreateIssue {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Creating the draft pull request failed.
    #[error("GITHUB_CREATE_PR_FAILED: {status} {body}")]
    CreatePr {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Transport-level failure.
    #[error("GITHUB_REQUEST_FAILED: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Capability trait over the forge.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Fetch an issue.
    async fn get_issue(&self, repo: &str, issue_number: i64) -> Result<ForgeIssue, ForgeError>;

    /// Create an issue with labels.
    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<ForgeIssue, ForgeError>;

    /// Open a draft pull request and return its browser URL.
    async fn create_draft_pull_request(
        &self,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<String, ForgeError>;

    /// A short-lived installation token for authenticated git transport.
    async fn installation_token(&self) -> Result<String, ForgeError>;
}

/// Build the forge client for the configured run mode.
pub fn forge_client(settings: &Settings) -> Arc<dyn ForgeClient> {
    if settings.is_fast_mode() {
        Arc::new(SyntheticForgeClient)
    } else {
        Arc::new(GitHubAppClient::new(settings.clone()))
    }
}

/// Split `owner/name`, rejecting malformed slugs.
pub fn split_repo(repo: &str) -> Result<(&str, &str), ForgeError> {
    let (owner, name) = repo
        .split_once('/')
        .ok_or_else(|| ForgeError::InvalidRepoSlug(repo.to_string()))?;
    if owner.is_empty() || name.is_empty() {
        return Err(ForgeError::InvalidRepoSlug(repo.to_string()));
    }
    Ok((owner, name))
}

/// HTTPS clone URL for a repo slug.
pub fn repo_https_url(repo: &str) -> Result<String, ForgeError> {
    let (owner, name) = split_repo(repo)?;
    Ok(format!("https://github.com/{owner}/{name}.git"))
}

/// Offline forge for fast mode: issues and PRs are fabricated locally.
pub struct SyntheticForgeClient;

#[async_trait]
impl ForgeClient for SyntheticForgeClient {
    async fn get_issue(&self, repo: &str, issue_number: i64) -> Result<ForgeIssue, ForgeError> {
        split_repo(repo)?;
        Ok(ForgeIssue {
            number: issue_number,
            title: format!("Issue #{issue_number}"),
            body: String::new(),
            html_url: format!("https://github.com/{repo}/issues/{issue_number}"),
        })
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        _labels: &[String],
    ) -> Result<ForgeIssue, ForgeError> {
        split_repo(repo)?;
        let number = (Uuid::new_v4().as_u128() % 2_000_000_000) as i64 + 1;
        Ok(ForgeIssue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            html_url: format!("https://github.com/{repo}/issues/{number}"),
        })
    }

    async fn create_draft_pull_request(
        &self,
        repo: &str,
        _title: &str,
        head: &str,
        _base: &str,
        _body: &str,
    ) -> Result<String, ForgeError> {
        split_repo(repo)?;
        Ok(format!("https://github.com/{repo}/pull/{head}"))
    }

    async fn installation_token(&self) -> Result<String, ForgeError> {
        Ok("synthetic-token".into())
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Default)]
struct TokenCache {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// GitHub App client with a cached installation token.
pub struct GitHubAppClient {
    settings: Settings,
    http: reqwest::Client,
    cache: Mutex<TokenCache>,
}

impl GitHubAppClient {
    /// Client over the configured app credentials.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(TokenCache::default()),
        }
    }

    fn assert_configured(&self) -> Result<(), ForgeError> {
        let mut missing = Vec::new();
        if self.settings.github_app_id.is_empty() {
            missing.push("GITHUB_APP_ID");
        }
        if self.settings.github_app_installation_id.is_empty() {
            missing.push("GITHUB_APP_INSTALLATION_ID");
        }
        if self.settings.github_app_private_key_pem.is_empty() {
            missing.push("GITHUB_APP_PRIVATE_KEY_PEM");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::ConfigMissing(missing.join(", ")))
        }
    }

    fn private_key_pem(&self) -> String {
        let mut pem = self.settings.github_app_private_key_pem.trim().to_string();
        if pem.contains("\\n") {
            pem = pem.replace("\\n", "\n");
        }
        if !pem.ends_with('\n') {
            pem.push('\n');
        }
        pem
    }

    fn app_jwt(&self) -> Result<String, ForgeError> {
        self.assert_configured()?;
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 540,
            iss: self.settings.github_app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem().as_bytes())
            .map_err(|e| ForgeError::Jwt(e.to_string()))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ForgeError::Jwt(e.to_string()))
    }

    async fn read_error_body(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(512)
            .collect()
    }
}

#[async_trait]
impl ForgeClient for GitHubAppClient {
    async fn installation_token(&self) -> Result<String, ForgeError> {
        {
            let cache = self.cache.lock().await;
            if let Some(expires_at) = cache.expires_at {
                if !cache.token.is_empty() && Utc::now() < expires_at - chrono::Duration::seconds(60)
                {
                    return Ok(cache.token.clone());
                }
            }
        }

        let jwt = self.app_jwt()?;
        let url = format!(
            "{API_ROOT}/app/installations/{}/access_tokens",
            self.settings.github_app_installation_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 201 {
            return Err(ForgeError::InstallationToken {
                status: status.as_u16(),
                body: Self::read_error_body(response).await,
            });
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: String,
            #[serde(default)]
            expires_at: String,
        }
        let payload: TokenResponse = response.json().await?;
        if payload.token.is_empty() || payload.expires_at.is_empty() {
            return Err(ForgeError::InstallationTokenInvalid);
        }
        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|_| ForgeError::InstallationTokenInvalid)?
            .with_timezone(&Utc);

        let mut cache = self.cache.lock().await;
        cache.token = payload.token.clone();
        cache.expires_at = Some(expires_at);
        Ok(payload.token)
    }

    async fn get_issue(&self, repo: &str, issue_number: i64) -> Result<ForgeIssue, ForgeError> {
        let token = self.installation_token().await?;
        let (owner, name) = split_repo(repo)?;
        let response = self
            .http
            .get(format!("{API_ROOT}/repos/{owner}/{name}/issues/{issue_number}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForgeError::GetIssue {
                status: status.as_u16(),
                body: Self::read_error_body(response).await,
            });
        }
        let payload: serde_json::Value = response.json().await?;
        Ok(ForgeIssue {
            number: payload["number"].as_i64().unwrap_or(issue_number),
            title: payload["title"].as_str().unwrap_or_default().to_string(),
            body: payload["body"].as_str().unwrap_or_default().to_string(),
            html_url: payload["html_url"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<ForgeIssue, ForgeError> {
        let token = self.installation_token().await?;
        let (owner, name) = split_repo(repo)?;
        let response = self
            .http
            .post(format!("{API_ROOT}/repos/{owner}/{name}/issues"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&json!({ "title": title, "body": body, "labels": labels }))
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 201 {
            return Err(ForgeError::CreateIssue {
                status: status.as_u16(),
                body: Self::read_error_body(response).await,
            });
        }
        let payload: serde_json::Value = response.json().await?;
        let number = payload["number"]
            .as_i64()
            .ok_or_else(|| ForgeError::CreateIssue {
                status: status.as_u16(),
                body: "response missing issue number".into(),
            })?;
        Ok(ForgeIssue {
            number,
            title: payload["title"].as_str().unwrap_or_default().to_string(),
            body: payload["body"].as_str().unwrap_or_default().to_string(),
            html_url: payload["html_url"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn create_draft_pull_request(
        &self,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<String, ForgeError> {
        let token = self.installation_token().await?;
        let (owner, name) = split_repo(repo)?;
        let response = self
            .http
            .post(format!("{API_ROOT}/repos/{owner}/{name}/pulls"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
                "draft": true,
            }))
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 201 {
            return Err(ForgeError::CreatePr {
                status: status.as_u16(),
                body: Self::read_error_body(response).await,
            });
        }
        let payload: serde_json::Value = response.json().await?;
        Ok(payload["html_url"].as_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_repo_accepts_owner_name() {
        assert_eq!(split_repo("acme/repo").unwrap(), ("acme", "repo"));
        assert_eq!(split_repo("acme/repo/extra").unwrap(), ("acme", "repo/extra"));
    }

    #[test]
    fn split_repo_rejects_malformed_slugs() {
        for bad in ["acme", "/repo", "acme/", ""] {
            let err = split_repo(bad).unwrap_err();
            assert!(err.to_string().starts_with("INVALID_REPO_SLUG"), "{bad}");
        }
    }

    #[test]
    fn https_url_shape() {
        assert_eq!(
            repo_https_url("acme/repo").unwrap(),
            "https://github.com/acme/repo.git"
        );
    }

    #[tokio::test]
    async fn synthetic_issue_numbers_are_positive_32_bit() {
        let client = SyntheticForgeClient;
        for _ in 0..32 {
            let issue = client.create_issue("acme/repo", "t", "b", &[]).await.unwrap();
            assert!(issue.number >= 1);
            assert!(issue.number <= 2_000_000_000);
        }
    }

    #[tokio::test]
    async fn unconfigured_app_reports_missing_vars() {
        let client = GitHubAppClient::new(Settings::default());
        let err = client.installation_token().await.unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("GITHUB_APP_CONFIG_MISSING"));
        assert!(text.contains("GITHUB_APP_ID"));
        assert!(text.contains("GITHUB_APP_PRIVATE_KEY_PEM"));
    }

    #[test]
    fn error_display_is_the_stable_code() {
        let err = ForgeError::CreatePr {
            status: 403,
            body: "forbidden".into(),
        };
        assert!(err.to_string().starts_with("GITHUB_CREATE_PR_FAILED: 403"));
        let err = ForgeError::InstallationTokenInvalid;
        assert_eq!(err.to_string(), "GITHUB_INSTALLATION_TOKEN_INVALID_RESPONSE");
    }
}
