use http::StatusCode;
use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};

/// Stable error codes surfaced by every API endpoint and recorded on entity
/// rows. The set is part of the external contract; do not renumber or rename.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Conflict,
    Exhausted,
    DriverUnavailable,
    DriverTimeout,
    DriverTerminal,
    StorageUnavailable,
    Unauthorized,
    UnsupportedArch,
    Internal,
}

serde_plain::derive_display_from_serialize!(ErrorCode);
serde_plain::derive_fromstr_from_deserialize!(ErrorCode);

impl ErrorCode {
    /// The HTTP status this code maps to.
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Exhausted => StatusCode::INSUFFICIENT_STORAGE,
            ErrorCode::DriverUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DriverTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::DriverTerminal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::UnsupportedArch => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether an operation failing with this code may be retried without
    /// operator intervention.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::DriverUnavailable | ErrorCode::DriverTimeout | ErrorCode::StorageUnavailable
        )
    }
}

/// Typed error carried inside an [`anyhow::Error`].
///
/// Handlers and the reconciler create these with [`api_err!`]/[`api_bail!`];
/// the response formatter recovers them by downcast and renders the
/// `{code, message, details?}` envelope with the mapped HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn new(code: ErrorCode, message: String) -> Self {
        ApiError {
            code,
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.details.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("ApiError", len)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(details) = &self.details {
            state.serialize_field("details", details)?;
        }
        state.end()
    }
}

/// The [`ErrorCode`] of an error chain, [`ErrorCode::Internal`] if it does
/// not carry an [`ApiError`].
pub fn error_code(err: &anyhow::Error) -> ErrorCode {
    match err.downcast_ref::<ApiError>() {
        Some(api_err) => api_err.code,
        None => ErrorCode::Internal,
    }
}

/// Macro to create an [`ApiError`] inside an [`anyhow::Error`].
#[macro_export]
macro_rules! api_err {
    ($code:ident, $($fmt:tt)+) => {{
        ::anyhow::Error::from($crate::ApiError::new(
            $crate::ErrorCode::$code,
            format!($($fmt)+)
        ))
    }};
}

/// Bail with an error generated with the [`api_err!`] macro.
#[macro_export]
macro_rules! api_bail {
    ($code:ident, $($fmt:tt)+) => {{
        return Err($crate::api_err!($code, $($fmt)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        assert_eq!(ErrorCode::DriverTimeout.to_string(), "driver_timeout");
        assert_eq!(
            "storage_unavailable".parse::<ErrorCode>().unwrap(),
            ErrorCode::StorageUnavailable
        );
    }

    #[test]
    fn downcast_from_anyhow() {
        fn fails() -> Result<(), anyhow::Error> {
            api_bail!(Conflict, "generation mismatch on {}", "vm-1");
        }
        let err = fails().unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);
        assert_eq!(err.to_string(), "generation mismatch on vm-1");

        let plain = anyhow::anyhow!("boom");
        assert_eq!(error_code(&plain), ErrorCode::Internal);
    }

    #[test]
    fn envelope_shape() {
        let err = ApiError::new(ErrorCode::NotFound, "no such vm".into())
            .with_details(serde_json::json!({ "id": "x" }));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "not_found");
        assert_eq!(value["message"], "no such vm");
        assert_eq!(value["details"]["id"], "x");
    }
}
