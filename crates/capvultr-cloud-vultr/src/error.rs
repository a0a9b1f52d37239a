//! Vultr provider error types

use capvultr_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VultrError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Vultr API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl VultrError {
    pub fn status(&self) -> Option<u16> {
        match self {
            VultrError::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<VultrError> for CloudError {
    fn from(err: VultrError) -> Self {
        match err {
            VultrError::MissingEnvVar(var) => CloudError::InvalidConfig(var),
            VultrError::ApiError { status: 401, message }
            | VultrError::ApiError { status: 403, message } => {
                CloudError::AuthenticationFailed(message)
            }
            VultrError::ApiError { status: 404, message } => CloudError::ResourceNotFound(message),
            VultrError::ApiError { status, message } => CloudError::ApiError { status, message },
            VultrError::Http(e) if e.is_timeout() => CloudError::Timeout(e.to_string()),
            VultrError::Http(e) => CloudError::RequestFailed(e.to_string()),
            VultrError::JsonError(e) => CloudError::Json(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, VultrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_map_to_cloud_errors() {
        let auth: CloudError = VultrError::ApiError {
            status: 401,
            message: "Invalid API token".to_string(),
        }
        .into();
        assert!(matches!(auth, CloudError::AuthenticationFailed(_)));

        let missing: CloudError = VultrError::ApiError {
            status: 404,
            message: "gone".to_string(),
        }
        .into();
        assert!(missing.is_not_found());

        let server: CloudError = VultrError::ApiError {
            status: 503,
            message: "busy".to_string(),
        }
        .into();
        assert!(matches!(server, CloudError::ApiError { status: 503, .. }));
    }
}
