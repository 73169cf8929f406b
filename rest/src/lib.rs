#![warn(missing_docs)]
//! Thin HTTP transport over the broker core.
//!
//! Every response is a JSON envelope carrying `status` and `success`
//! alongside the payload. Invalid input surfaces as 4xx; nothing the
//! transport does mutates orchestration state directly.

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use snafu::Snafu;

use broker::BrokerError;

pub mod api;

/// Errors a handler can surface
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum RestError {
    #[snafu(display("{}", source))]
    Broker { source: BrokerError },
    #[snafu(display("{}", message))]
    BadRequest { message: String },
    #[snafu(display("{}", message))]
    NotFound { message: String },
}

impl RestError {
    /// 404 with a message
    pub fn not_found(message: impl Into<String>) -> RestError {
        RestError::NotFound {
            message: message.into(),
        }
    }

    /// 400 with a message
    pub fn bad_request(message: impl Into<String>) -> RestError {
        RestError::BadRequest {
            message: message.into(),
        }
    }
}

impl From<BrokerError> for RestError {
    fn from(source: BrokerError) -> Self {
        RestError::Broker { source }
    }
}

impl ResponseError for RestError {
    fn status_code(&self) -> StatusCode {
        match self {
            RestError::NotFound { .. } => StatusCode::NOT_FOUND,
            RestError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            RestError::Broker { source } => match source {
                BrokerError::PlanNotFound { .. }
                | BrokerError::RunNotFound { .. }
                | BrokerError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
                BrokerError::PlanDisabled { .. }
                | BrokerError::RunAlreadyCompleted { .. }
                | BrokerError::Storage { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        envelope(
            self.status_code(),
            serde_json::json!({ "message": self.to_string() }),
        )
    }
}

/// Wrap `body` in the `{status, success, …}` envelope
pub fn envelope(status: StatusCode, body: serde_json::Value) -> HttpResponse {
    let mut body = body;
    if let Some(map) = body.as_object_mut() {
        map.insert("status".to_string(), status.as_u16().into());
        map.insert("success".to_string(), (status.as_u16() <= 299).into());
    }
    HttpResponse::build(status).json(body)
}

/// 200 envelope
pub fn ok(body: serde_json::Value) -> HttpResponse {
    envelope(StatusCode::OK, body)
}

/// Register every API route
pub fn configure(cfg: &mut web::ServiceConfig) {
    api::root::configure(cfg);
    api::projects::configure(cfg);
    api::plans::configure(cfg);
    api::runs::configure(cfg);
    api::orchestrate::configure(cfg);
    api::instances::configure(cfg);
}
