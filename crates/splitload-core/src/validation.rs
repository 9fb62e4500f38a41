//! Response validation
//!
//! Each function turns a raw response into a [`Check`]: the status class,
//! whether the status is the expected one, the parsed payload (if the body had
//! the expected shape) and the result of any domain predicate. Operations and
//! tests share these instead of re-implementing checks inline.

use serde::Serialize;
use serde_json::Value;

use crate::http::ApiResponse;

/// HTTP status class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            100..=199 => Self::Informational,
            200..=299 => Self::Success,
            300..=399 => Self::Redirection,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

/// Validated response
#[derive(Debug, Clone, PartialEq)]
pub struct Check<T> {
    pub status: u16,
    pub class: StatusClass,
    /// Status matched what the call expects
    pub status_ok: bool,
    /// Parsed body, `None` when missing or malformed
    pub payload: Option<T>,
    /// Domain predicate over the payload
    pub domain_ok: bool,
}

impl<T> Check<T> {
    fn new(status: u16, status_ok: bool, payload: Option<T>) -> Self {
        let domain_ok = payload.is_some();
        Self {
            status,
            class: StatusClass::of(status),
            status_ok,
            payload,
            domain_ok,
        }
    }

    pub fn passed(&self) -> bool {
        self.status_ok && self.payload.is_some() && self.domain_ok
    }

    /// Apply an extra predicate to the payload
    pub fn require(mut self, predicate: impl FnOnce(&T) -> bool) -> Self {
        self.domain_ok = self.domain_ok && self.payload.as_ref().map_or(false, predicate);
        self
    }

    /// Short reason for logs when the check failed
    pub fn failure_reason(&self) -> Option<&'static str> {
        if !self.status_ok {
            Some("unexpected_status")
        } else if self.payload.is_none() {
            Some("malformed_body")
        } else if !self.domain_ok {
            Some("predicate_failed")
        } else {
            None
        }
    }
}

/// `201 Created` with an `id` in the JSON body
pub fn created_with_id(response: &ApiResponse) -> Check<Value> {
    let status_ok = response.status == 201;
    let id = serde_json::from_str::<Value>(&response.body)
        .ok()
        .and_then(|body| body.get("id").cloned())
        .filter(|id| !id.is_null());
    Check::new(response.status, status_ok, id)
}

/// `200 OK` with a JSON array body
pub fn json_array(response: &ApiResponse) -> Check<Vec<Value>> {
    let status_ok = response.status == 200;
    let items = match serde_json::from_str::<Value>(&response.body) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    };
    Check::new(response.status, status_ok, items)
}

/// `200 OK` with a non-empty JSON array body
pub fn non_empty_array(response: &ApiResponse) -> Check<Vec<Value>> {
    json_array(response).require(|items| !items.is_empty())
}

/// Classification of a delete response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Record removed (200 or 204)
    Deleted,
    /// Nothing to remove (404); valid, deletes are idempotent
    Missing,
    /// Anything else
    Unexpected,
}

impl DeleteOutcome {
    pub fn classify(status: u16) -> Self {
        match status {
            200 | 204 => Self::Deleted,
            404 => Self::Missing,
            _ => Self::Unexpected,
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, Self::Unexpected)
    }
}

/// Classification of an insert that targets a shared unique key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOutcome {
    /// 201: this request created the record
    Won,
    /// 409/422/500: the uniqueness constraint rejected it
    Rejected,
    /// Any other status
    NotRejected,
}

impl DuplicateOutcome {
    pub fn classify(status: u16) -> Self {
        match status {
            201 => Self::Won,
            409 | 422 | 500 => Self::Rejected,
            _ => Self::NotRejected,
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, Self::NotRejected)
    }
}
