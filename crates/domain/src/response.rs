//! Wire response envelope.
//!
//! Every request gets exactly one of these back, serialized as a single
//! JSON line. Errors are in-band: `status:"error"` plus a human-readable
//! `message` and a stable `code`, never a dropped connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            status: Status::Ok,
            data: Some(data),
            message: None,
            code: None,
        }
    }

    pub fn ok_with_message(data: Value, message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            data: Some(data),
            message: Some(message.into()),
            code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            data: None,
            message: Some(message.into()),
            code: None,
        }
    }

    /// Error response carrying structured data alongside the message.
    ///
    /// Assertion failures use this shape: `status:"error"` with
    /// `data.passed == false` and the recorded expected/actual values.
    pub fn error_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            status: Status::Error,
            data: Some(data),
            message: Some(message.into()),
            code: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Self {
            status: Status::Error,
            data: None,
            message: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        Response::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_response_serializes_without_empty_fields() {
        let resp = Response::ok(json!({"running": false}));
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(line, r#"{"status":"ok","data":{"running":false}}"#);
    }

    #[test]
    fn auth_error_matches_wire_contract() {
        let resp = Response::from(Error::Auth);
        let v: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["message"], "Unauthorized - invalid or missing token");
        assert_eq!(v["code"], "auth");
    }

    #[test]
    fn session_mismatch_message_names_both_sessions() {
        let err = Error::SessionMismatch {
            manager: "S1".into(),
            requested: "S2".into(),
        };
        assert_eq!(
            err.to_string(),
            "Session ID mismatch. Manager session: S1, requested: S2"
        );
    }

    #[test]
    fn error_with_data_keeps_both_channels() {
        let resp = Response::error_with_data(
            "assertion failed",
            json!({"passed": false, "expected": "visible", "actual": "hidden"}),
        );
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.data.as_ref().unwrap()["passed"], false);
    }

    #[test]
    fn response_round_trips() {
        let resp = Response::ok(json!({"mocks": []}));
        let line = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&line).unwrap();
        assert!(back.is_ok());
        assert_eq!(back.data.unwrap()["mocks"], json!([]));
    }
}
