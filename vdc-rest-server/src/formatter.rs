//! Response formatting.
//!
//! Success responses carry the handler's json value verbatim; errors are
//! rendered as the uniform `{code, message, details?}` envelope with the
//! HTTP status mapped from the stable error code. Errors that do not carry
//! an [`ApiError`] are reported as `internal`.

use anyhow::Error;
use hyper::header;
use hyper::{Response, StatusCode};
use serde_json::{json, Value};

use vdc_api_types::{ApiError, ErrorCode};

use crate::Body;

static JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Server-side log message attached to error responses.
#[derive(Clone)]
pub(crate) struct ErrorMessageExtension(pub String);

fn json_response(status: StatusCode, data: &Value) -> Response<Body> {
    let mut response = Response::new(Body::new(bytes::Bytes::from(data.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    response
}

/// Format a successful handler result.
pub fn format_data(data: Value, success_status: u16) -> Response<Body> {
    let status = StatusCode::from_u16(success_status).unwrap_or(StatusCode::OK);
    json_response(status, &data)
}

/// Format an error as the `{code, message, details?}` envelope.
pub fn format_error(err: Error) -> Response<Body> {
    let message = err.to_string();

    let (status, envelope) = match err.downcast_ref::<ApiError>() {
        Some(api_err) => (
            api_err.code.http_status(),
            serde_json::to_value(api_err).unwrap_or_else(|_| {
                json!({ "code": api_err.code, "message": api_err.message })
            }),
        ),
        None => (
            ErrorCode::Internal.http_status(),
            json!({ "code": ErrorCode::Internal, "message": message }),
        ),
    };

    let mut response = json_response(status, &envelope);
    response
        .extensions_mut()
        .insert(ErrorMessageExtension(message));
    response
}

pub fn format_result(result: Result<Value, Error>, success_status: u16) -> Response<Body> {
    match result {
        Ok(data) => format_data(data, success_status),
        Err(err) => format_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdc_api_types::api_err;

    #[test]
    fn api_errors_map_status_codes() {
        let response = format_error(api_err!(NotFound, "no such vm"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = format_error(api_err!(Conflict, "generation mismatch"));
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = format_error(api_err!(Exhausted, "pool empty"));
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[test]
    fn plain_errors_become_internal() {
        let response = format_error(anyhow::anyhow!("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn success_status_is_used() {
        let response = format_data(json!({"ok": true}), 202);
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
