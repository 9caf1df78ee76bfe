// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Envelopes for the REST fallback surface.
//!
//! Successful responses follow a resource-plus-attributes shape; failures
//! carry a `{status, code, title, detail}` error envelope.

use serde::{Deserialize, Serialize};

/// Top-level success document: `{"data": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document<T> {
    pub data: Resource<T>,
}

impl<T> Document<T> {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, attributes: T) -> Self {
        Self {
            data: Resource { id: id.into(), kind: kind.into(), attributes },
        }
    }
}

/// A single resource with typed attributes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource<T> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: T,
}

/// Error envelope shared by REST responses and CLI exit paths.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    /// HTTP status code.
    pub status: u16,
    /// Stable machine-readable code, e.g. `stream_not_found`.
    pub code: String,
    /// Short human-readable summary.
    pub title: String,
    /// Occurrence-specific detail.
    pub detail: String,
}

impl ErrorEnvelope {
    pub fn new(
        status: u16,
        code: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self { status, code: code.into(), title: title.into(), detail: detail.into() }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, "stream_not_found", "Stream not found", detail)
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, "bad_request", "Bad request", detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(500, "internal_error", "Internal error", detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_serializes_resource_shape() {
        #[derive(Serialize)]
        struct Attrs {
            status: &'static str,
        }

        let doc = Document::new("s1", "stream", Attrs { status: "Live" });
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"data":{"id":"s1","type":"stream","attributes":{"status":"Live"}}})
        );
    }

    #[test]
    fn error_envelope_carries_all_fields() {
        let err = ErrorEnvelope::not_found("no state for stream s9");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], 404);
        assert_eq!(value["code"], "stream_not_found");
        assert!(value["detail"].as_str().unwrap().contains("s9"));
    }
}
