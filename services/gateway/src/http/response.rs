use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

pub type HttpResponse = Response;
pub type HttpResult<T = ()> = Result<T, HttpResponse>;

#[derive(Debug, Serialize, PartialEq)]
pub struct HttpErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorBody {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn internal_error(err: impl Display) -> HttpResponse {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        err.to_string(),
    )
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

pub fn unauthorized(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn too_many_requests(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
}

pub fn service_unavailable(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(
        response: Response,
        expected_status: StatusCode,
        expected_code: &str,
        expected_message: &str,
    ) {
        assert_eq!(response.status(), expected_status);

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: HttpErrorBody =
            serde_json::from_slice(&body).expect("response body should be valid error json");

        assert_eq!(parsed.code, expected_code);
        assert_eq!(parsed.message, expected_message);
        assert_eq!(parsed.details, None);
    }

    #[tokio::test]
    async fn internal_error_sets_internal_contract() {
        let response = internal_error("registry lock poisoned");
        assert_error_response(
            response,
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "registry lock poisoned",
        )
        .await;
    }

    #[tokio::test]
    async fn bad_request_sets_bad_request_contract() {
        let response = bad_request("invalid query");
        assert_error_response(response, StatusCode::BAD_REQUEST, "BAD_REQUEST", "invalid query").await;
    }

    #[tokio::test]
    async fn unauthorized_sets_unauthorized_contract() {
        let response = unauthorized("missing bearer token");
        assert_error_response(response, StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing bearer token").await;
    }

    #[tokio::test]
    async fn too_many_requests_sets_rate_limited_contract() {
        let response = too_many_requests("slow down");
        assert_error_response(response, StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "slow down").await;
    }

    #[tokio::test]
    async fn service_unavailable_sets_shutting_down_contract() {
        let response = service_unavailable("draining connections");
        assert_error_response(
            response,
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "draining connections",
        )
        .await;
    }
}
