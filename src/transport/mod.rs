//! Transport layer
//!
//! Every database operation is a single request/response exchange:
//!
//! ```text
//! Request { method, path segments, query pairs, JSON body }
//!   └─→ Transport::send
//!        └─→ Response { status, JSON body }
//! ```
//!
//! Two transports implement the contract:
//! - `HttpTransport`: reqwest client against a real server
//! - `MemoryTransport`: in-process emulation used by tests, local
//!   development and the stub server

pub mod http;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

pub use http::HttpTransport;
pub use memory::MemoryTransport;

/// A request against the server, relative to its root
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Unencoded path segments, e.g. `["db", "_design", "model"]`
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            segments: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Append a document id. Design document ids keep their `_design/`
    /// prefix as a separate segment.
    pub fn doc_id(self, id: &str) -> Self {
        match id.strip_prefix("_design/") {
            Some(name) => self.segment("_design").segment(name),
            None => self.segment(id),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Slash-joined path, for logging
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

/// A server reply
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `error` field of an error reply
    pub fn error(&self) -> &str {
        self.body.get("error").and_then(Value::as_str).unwrap_or("")
    }

    /// The `reason` field of an error reply, or the raw text of a non-JSON one
    pub fn reason(&self) -> &str {
        self.body
            .get("reason")
            .and_then(Value::as_str)
            .or_else(|| self.body.as_str())
            .unwrap_or("")
    }
}

/// Transport trait
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_design_ids_split_into_segments() {
        let request = Request::get().segment("db").doc_id("_design/proof_of_concept");
        assert_eq!(request.segments, vec!["db", "_design", "proof_of_concept"]);
        assert_eq!(request.path(), "/db/_design/proof_of_concept");
    }

    #[test]
    fn test_plain_ids_stay_whole() {
        let request = Request::delete().segment("db").doc_id("a/b").param("rev", "1-x");
        assert_eq!(request.segments, vec!["db", "a/b"]);
        assert_eq!(request.query, vec![("rev".to_string(), "1-x".to_string())]);
    }

    #[test]
    fn test_response_error_fields() {
        let response = Response::new(409, json!({"error": "conflict", "reason": "Document update conflict."}));
        assert!(!response.is_success());
        assert_eq!(response.error(), "conflict");
        assert_eq!(response.reason(), "Document update conflict.");
    }
}
