//! Vultr v2 REST client
//!
//! Thin wrapper over `reqwest` that adds bearer authentication and turns
//! non-success responses into [`VultrError::ApiError`] with the message Vultr
//! returns in its `{"error": ..., "status": ...}` body.

use crate::error::{Result, VultrError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.vultr.com/v2";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and endpoint for the Vultr API
#[derive(Debug, Clone)]
pub struct VultrConfig {
    pub api_key: String,
    pub base_url: String,
}

impl VultrConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Create VultrConfig from `VULTR_API_KEY` and optional `VULTR_API_URL`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("VULTR_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VultrError::MissingEnvVar("VULTR_API_KEY".to_string()))?;
        let base_url = std::env::var("VULTR_API_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Ok(Self { api_key, base_url })
    }
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

pub struct VultrClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl VultrClient {
    pub fn new(config: VultrConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET a resource; `Ok(None)` on 404
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.get_with_query(path, &[] as &[(&str, &str)]).await
    }

    /// GET with URL-encoded query parameters; `Ok(None)` on 404
    pub async fn get_with_query<T, Q>(&self, path: &str, query: &Q) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        tracing::debug!(path, "GET");
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        Ok(Some(response.json().await?))
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        tracing::debug!(path, "POST");
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        tracing::debug!(path, "PATCH");
        let response = self
            .http
            .patch(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    /// DELETE a resource; returns `false` when it was already gone
    pub async fn delete(&self, path: &str) -> Result<bool> {
        tracing::debug!(path, "DELETE");
        let response = self
            .http
            .delete(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .map(|b| b.error)
        .filter(|m| !m.is_empty())
        .unwrap_or(text);

    Err(VultrError::ApiError {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("VULTR_API_KEY", Some("secret")),
                ("VULTR_API_URL", None::<&str>),
            ],
            || {
                let config = VultrConfig::from_env().unwrap();
                assert_eq!(config.api_key, "secret");
                assert_eq!(config.base_url, DEFAULT_API_URL);
            },
        );
    }

    #[test]
    fn test_config_url_override() {
        temp_env::with_vars(
            [
                ("VULTR_API_KEY", Some("secret")),
                ("VULTR_API_URL", Some("http://localhost:8080/v2")),
            ],
            || {
                let config = VultrConfig::from_env().unwrap();
                assert_eq!(config.base_url, "http://localhost:8080/v2");
            },
        );
    }

    #[test]
    fn test_config_requires_api_key() {
        temp_env::with_var("VULTR_API_KEY", Some(""), || {
            let err = VultrConfig::from_env().unwrap_err();
            assert!(matches!(err, VultrError::MissingEnvVar(ref v) if v == "VULTR_API_KEY"));
        });
    }
}
