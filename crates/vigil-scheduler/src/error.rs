//! Errors of the external collaborator clients.

use thiserror::Error;
use vigil_core::VigilError;

/// Failure of a call to an external collaborator.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport failure, timeout or unreadable body.
    #[error("{service} request failed: {source}")]
    Request {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status.
    #[error("{service} returned {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },
}

impl ClientError {
    #[must_use]
    pub fn request(service: &'static str, source: reqwest::Error) -> Self {
        Self::Request { service, source }
    }

    #[must_use]
    pub const fn service(&self) -> &'static str {
        match self {
            Self::Request { service, .. } | Self::Api { service, .. } => service,
        }
    }
}

impl From<ClientError> for VigilError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api {
                service,
                status: 404,
                body,
            } => Self::NotFound {
                resource_type: service,
                id: body,
            },
            ClientError::Api {
                service,
                status: 400,
                body,
            } => Self::Validation(format!("{service}: {body}")),
            other => Self::ExternalService {
                service: other.service().to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_errors_map_by_status() {
        let not_found: VigilError = ClientError::Api {
            service: "integration",
            status: 404,
            body: "i-9".into(),
        }
        .into();
        assert!(matches!(not_found, VigilError::NotFound { resource_type: "integration", .. }));

        let unavailable: VigilError = ClientError::Api {
            service: "compliance",
            status: 503,
            body: "maintenance".into(),
        }
        .into();
        assert!(unavailable.is_retriable());
        assert!(unavailable.to_string().contains("503"));
    }
}
