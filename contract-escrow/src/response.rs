//! Response envelope and sensitive-field filtering for outer layers

use crate::{config::ResponseConfig, error::EscrowError, EscrowResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const GENERIC_ERROR_MESSAGE: &str = "An internal error occurred";

/// `{success, data, error, message}` body returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error taxonomy name, e.g. `DisputeActiveError`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Failure body; server-side failures get a generic message
    pub fn from_error(err: &EscrowError) -> Self {
        let message = if err.is_client_facing() {
            err.to_string()
        } else {
            GENERIC_ERROR_MESSAGE.to_string()
        };

        Self {
            success: false,
            data: None,
            error: Some(err.kind().to_string()),
            message: Some(message),
        }
    }

    /// Body and HTTP status for an operation result
    pub fn from_result(result: EscrowResult<T>) -> (u16, Self) {
        match result {
            Ok(data) => (200, Self::ok(data)),
            Err(err) => (err.status_code(), Self::from_error(&err)),
        }
    }
}

/// Removes object keys containing a sensitive name, at any depth
#[derive(Debug, Clone)]
pub struct SensitiveFieldFilter {
    fields: Vec<String>,
}

impl SensitiveFieldFilter {
    pub fn new(config: &ResponseConfig) -> Self {
        Self {
            fields: config
                .sensitive_fields
                .iter()
                .map(|field| field.to_lowercase())
                .collect(),
        }
    }

    /// Case-insensitive substring match against the configured names
    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fields.iter().any(|field| key.contains(field.as_str()))
    }

    pub fn filter(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                map.retain(|key, _| !self.is_sensitive(key));
                map.values_mut().for_each(|nested| self.filter(nested));
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.filter(item)),
            _ => {}
        }
    }

    /// Serialize `value` and strip sensitive fields
    pub fn to_filtered_value<T: Serialize>(&self, value: &T) -> EscrowResult<Value> {
        let mut value = serde_json::to_value(value)?;
        self.filter(&mut value);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_envelope_for_errors() {
        let conflict: ApiResponse<()> = ApiResponse::from_error(&EscrowError::conflict("pending request"));
        assert!(!conflict.success);
        assert_eq!(conflict.error.as_deref(), Some("ConflictError"));
        assert!(conflict.message.unwrap().contains("pending request"));

        let (status, storage) = ApiResponse::<()>::from_result(Err(EscrowError::storage("disk full at /var/db")));
        assert_eq!(status, 500);
        assert_eq!(storage.message.as_deref(), Some(GENERIC_ERROR_MESSAGE));

        let (status, dispute) = ApiResponse::<()>::from_result(Err(EscrowError::DisputeActive {
            dispute_id: Uuid::new_v4(),
            target: "milestone".into(),
        }));
        assert_eq!(status, 423);
        assert_eq!(dispute.error.as_deref(), Some("DisputeActiveError"));
    }

    #[test]
    fn test_success_body_shape() {
        let body = serde_json::to_value(ApiResponse::ok(json!({ "id": 1 })).with_message("Contract created")).unwrap();
        assert_eq!(
            body,
            json!({ "success": true, "data": { "id": 1 }, "message": "Contract created" })
        );
    }

    #[test]
    fn test_nested_sensitive_fields_are_removed() {
        let filter = SensitiveFieldFilter::new(&ResponseConfig::default());
        let mut value = json!({
            "title": "Logo",
            "Password": "hunter2",
            "client": {
                "id": "u1",
                "accessToken": "abc",
                "payment_instrument": { "last4": "4242" }
            },
            "milestones": [
                { "amount": "10.00", "card_number": "4242" },
                { "amount": "5.00", "notes": ["keep"] }
            ]
        });

        filter.filter(&mut value);
        assert_eq!(
            value,
            json!({
                "title": "Logo",
                "client": { "id": "u1" },
                "milestones": [
                    { "amount": "10.00" },
                    { "amount": "5.00", "notes": ["keep"] }
                ]
            })
        );
    }

    #[test]
    fn test_custom_field_list() {
        let filter = SensitiveFieldFilter::new(&ResponseConfig {
            sensitive_fields: vec!["Email".into()],
        });
        let value = filter
            .to_filtered_value(&json!({ "user_email": "a@b.c", "token": "kept" }))
            .unwrap();
        assert_eq!(value, json!({ "token": "kept" }));
    }
}
