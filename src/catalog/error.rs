use serde::Deserialize;
use thiserror::Error;

/// Failures of a catalog API call.
///
/// Every variant is treated the same way by the mutation coordinator: the
/// optimistic edit is rolled back and the error is handed to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
  /// 404, id unmatched
  #[error("not found: {0}")]
  NotFound(String),
  /// 400, missing or invalid fields
  #[error("invalid input: {0}")]
  InvalidInput(String),
  /// 5xx from the server
  #[error("server error {status}: {message}")]
  TransientServerFault { status: u16, message: String },
  /// Connection, timeout or other transport failure
  #[error("network failure: {0}")]
  NetworkFailure(String),
  /// 2xx with a body that is not the expected shape
  #[error("malformed response: {0}")]
  MalformedResponse(String),
  /// Any other non-2xx status
  #[error("unexpected status {status}: {message}")]
  UnexpectedStatus { status: u16, message: String },
}

#[derive(Deserialize)]
struct ErrorBody {
  error: String,
}

impl ApiError {
  /// Map a non-2xx response to an error, using the `{"error": ...}` body
  /// message when present.
  pub fn from_status(status: u16, body: &str) -> Self {
    let message = serde_json::from_str::<ErrorBody>(body)
      .map(|b| b.error)
      .unwrap_or_else(|_| body.trim().to_string());

    match status {
      404 => ApiError::NotFound(message),
      400 => ApiError::InvalidInput(message),
      500..=599 => ApiError::TransientServerFault { status, message },
      _ => ApiError::UnexpectedStatus { status, message },
    }
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(e: reqwest::Error) -> Self {
    ApiError::NetworkFailure(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert_eq!(
      ApiError::from_status(404, r#"{"error":"Not found"}"#),
      ApiError::NotFound("Not found".to_string())
    );
    assert_eq!(
      ApiError::from_status(400, r#"{"error":"Invalid input"}"#),
      ApiError::InvalidInput("Invalid input".to_string())
    );
    assert_eq!(
      ApiError::from_status(503, "upstream down"),
      ApiError::TransientServerFault {
        status: 503,
        message: "upstream down".to_string()
      }
    );
    assert!(matches!(
      ApiError::from_status(409, ""),
      ApiError::UnexpectedStatus { status: 409, .. }
    ));
  }
}
