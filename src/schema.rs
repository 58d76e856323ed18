//! API response models and template validation.

use crate::error::PipelineError;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Success payload for `/process`: the merged knowledge plus a success flag
/// and processing timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub message: String,
    pub data: Value,
    pub processed_at: String,
}

impl ProcessResponse {
    pub fn new(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            processed_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Failure payload: human-readable message plus optional detail.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(detail.into()),
        }
    }
}

/// The knowledge template is opaque: the only assertion made about its shape
/// is that the top level is a JSON object.
pub fn validate_template(template: &Value) -> Result<(), PipelineError> {
    if template.is_object() {
        Ok(())
    } else {
        Err(PipelineError::Validation(
            "Knowledge template must be a JSON object".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_templates_pass() {
        assert!(validate_template(&json!({"topics": []})).is_ok());
        assert!(validate_template(&json!({})).is_ok());
    }

    #[test]
    fn non_object_templates_are_rejected() {
        assert!(validate_template(&json!([1, 2])).is_err());
        assert!(validate_template(&json!("topics")).is_err());
        assert!(validate_template(&json!(null)).is_err());
    }

    #[test]
    fn nested_shape_is_not_introspected() {
        // Heterogeneous nesting is fine; only the top level matters
        let template = json!({
            "topics": [],
            "meta": {"weights": [0.1, null, "x"], "flag": true}
        });
        assert!(validate_template(&template).is_ok());
    }

    #[test]
    fn success_response_carries_rfc3339_timestamp() {
        let response = ProcessResponse::new("ok", json!({}));
        assert!(response.success);
        assert!(chrono::DateTime::parse_from_rfc3339(&response.processed_at).is_ok());
    }
}
