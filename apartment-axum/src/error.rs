use apartment_core::BrokerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// HTTP-facing error classes, named and cased like the DogRS error shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    GeneralError,
    Unavailable,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::GeneralError => 500,
            ErrorKind::Unavailable => 503,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::Unavailable => "unavailable",
        }
    }

    fn of(err: &BrokerError) -> Self {
        match err {
            BrokerError::TenantMissing | BrokerError::TenantRejected { .. } => ErrorKind::BadRequest,
            BrokerError::ConnectionAcquisitionFailed { .. } => ErrorKind::Unavailable,
            _ => ErrorKind::GeneralError,
        }
    }
}

/// Error type for handlers and extractors behind the tenant middleware.
///
/// A [`BrokerError`] anywhere in the chain keeps its classification and its
/// message; anything else is reported as a `GeneralError` with a generic
/// message. Driver causes and handler errors are logged, never sent to the
/// client.
#[derive(Debug)]
pub struct ApartmentAxumError(pub anyhow::Error);

impl From<anyhow::Error> for ApartmentAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<BrokerError> for ApartmentAxumError {
    fn from(e: BrokerError) -> Self {
        Self(e.into())
    }
}

impl ApartmentAxumError {
    pub fn kind(&self) -> ErrorKind {
        self.0
            .chain()
            .find_map(|e| e.downcast_ref::<BrokerError>())
            .map(ErrorKind::of)
            .unwrap_or(ErrorKind::GeneralError)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let kind = self.kind();
        let message = match self.0.chain().find_map(|e| e.downcast_ref::<BrokerError>()) {
            Some(broker) => broker.to_string(),
            None => INTERNAL_ERROR_MESSAGE.to_string(),
        };
        json!({
            "name": kind.name(),
            "message": message,
            "code": kind.status_code(),
            "className": kind.class_name(),
        })
    }
}

impl IntoResponse for ApartmentAxumError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        if kind != ErrorKind::BadRequest {
            tracing::error!(error = ?self.0, "request failed");
        }
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}
