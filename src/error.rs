use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("drone unavailable: {0}")]
    UnavailableDrone(String),

    #[error("command {0} not found")]
    UnknownCommand(String),

    #[error("command {0} is already executing")]
    CommandInFlight(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a failed command handler. Only `Transient` is retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Rejected(String),

    #[error("weather unsafe: {0}")]
    UnsafeWeather(String),
}

impl From<LinkError> for HandlerError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Rejected(_) => HandlerError::Rejected(err.to_string()),
            _ => HandlerError::Transient(err.to_string()),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

impl From<PlanningError> for HandlerError {
    fn from(err: PlanningError) -> Self {
        match err {
            PlanningError::UnsafeWeather(reason) => HandlerError::UnsafeWeather(reason),
            _ => HandlerError::Rejected(err.to_string()),
        }
    }
}

impl From<VerificationError> for HandlerError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::Store(_) => HandlerError::Transient(err.to_string()),
            _ => HandlerError::Rejected(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanningError {
    #[error("weather conditions are not safe for flight: {0}")]
    UnsafeWeather(String),

    #[error("invalid flight plan: {0}")]
    InvalidPlan(String),

    #[error("no active flight path for drone {0}")]
    NoActivePath(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VerificationError {
    #[error("delivery token has expired")]
    Expired,

    #[error("delivery location mismatch: {distance_m:.1} m from drop-off")]
    LocationMismatch { distance_m: f64 },

    #[error("recipient phone number mismatch")]
    PhoneMismatch,

    #[error("invalid delivery order or drone assignment: {0}")]
    InvalidOrder(String),

    #[error("invalid delivery token")]
    InvalidToken,

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl VerificationError {
    pub fn code(&self) -> &'static str {
        match self {
            VerificationError::Expired => "EXPIRED",
            VerificationError::LocationMismatch { .. } => "LOCATION_MISMATCH",
            VerificationError::PhoneMismatch => "PHONE_MISMATCH",
            VerificationError::InvalidOrder(_) => "INVALID_ORDER",
            VerificationError::InvalidToken => "INVALID_TOKEN",
            VerificationError::Signing(_) | VerificationError::Store(_) => "VALIDATION_ERROR",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("drone {0} is not reachable")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("drone rejected command: {0}")]
    Rejected(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Dispatch(err) => match err {
                DispatchError::InvalidCommand(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_COMMAND", err.to_string())
                }
                DispatchError::UnavailableDrone(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE_DRONE",
                    err.to_string(),
                ),
                DispatchError::UnknownCommand(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
                }
                DispatchError::CommandInFlight(_) => {
                    (StatusCode::CONFLICT, "CONFLICT", err.to_string())
                }
                DispatchError::Store(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_ERROR",
                    err.to_string(),
                ),
            },
            AppError::Planning(err) => match err {
                PlanningError::UnsafeWeather(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNSAFE_WEATHER",
                    err.to_string(),
                ),
                PlanningError::InvalidPlan(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_PLAN", err.to_string())
                }
                PlanningError::NoActivePath(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
                }
            },
            AppError::Verification(err) => {
                let status = match err {
                    VerificationError::Expired => StatusCode::GONE,
                    VerificationError::Signing(_) | VerificationError::Store(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, err.code(), err.to_string())
            }
            AppError::Store(StoreError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
            }
            AppError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                err.to_string(),
            ),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg.clone())
            }
        };

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}
