//! API error type and its HTTP mapping

use crate::models::ErrorResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_control::{RegistryError, SubdomainError};
use burrow_pool::PoolError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidSubdomain(#[from] SubdomainError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Tunnel not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidSubdomain(_) => StatusCode::FORBIDDEN,
            ApiError::Registry(RegistryError::QuotaExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Registry(RegistryError::Superseded(_)) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::Pool(PoolError::Listen { .. })) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Registry(RegistryError::Pool(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API request failed: {}", self);
        }
        let body = ErrorResponse {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(SubdomainError::Invalid).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(RegistryError::QuotaExceeded {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                limit: 5,
            })
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(RegistryError::Pool(PoolError::Listen {
                address: "0.0.0.0:0".to_string(),
                reason: "denied".to_string(),
            }))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
    }
}
