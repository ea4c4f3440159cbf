use crate::models::{AccessStatus, FailureDetails, UsageLog, UsageMetrics};
use crate::services::{CommitOutcome, ValidationOutcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = validate_commit_shape, skip_on_field_errors = false))]
pub struct UsageCommitRequest {
    pub usage_id: Uuid,
    pub owner_id: Uuid,
    pub success: bool,
    pub metrics: Option<UsageMetrics>,
    pub failure: Option<FailureDetails>,
    /// Opaque caller payload; accepted for wire compatibility, never
    /// persisted.
    pub result_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UsageValidateRequest {
    pub owner_id: Uuid,
    #[validate(length(min = 1, max = 128, message = "request_id must be 1-128 characters"))]
    pub request_id: String,
    #[validate(length(min = 1, message = "feature_key cannot be empty"))]
    pub feature_key: String,
    #[validate(length(min = 1, message = "endpoint cannot be empty"))]
    pub endpoint: String,
    #[validate(length(min = 1, message = "method cannot be empty"))]
    pub method: String,
    #[validate(custom(function = validate_payload_hash))]
    pub payload_hash: String,
    pub usage_estimate: Option<serde_json::Value>,
    pub client_ip: Option<String>,
    pub client_user_agent: Option<String>,
}

fn validate_payload_hash(value: &str) -> Result<(), ValidationError> {
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ValidationError::new("payload_hash")
            .with_message("payload_hash must be 64 hex characters".into()))
    }
}

fn validate_commit_shape(request: &UsageCommitRequest) -> Result<(), ValidationError> {
    if !request.success && request.failure.is_none() {
        return Err(ValidationError::new("failure")
            .with_message("failure details are required when success is false".into()));
    }
    if request.success && request.failure.is_some() {
        return Err(ValidationError::new("failure")
            .with_message("failure details are only valid when success is false".into()));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct UsageValidateResponse {
    pub access: AccessStatus,
    pub usage_id: Uuid,
    pub message: String,
    pub credits_reserved: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
    pub replayed: bool,
}

impl From<ValidationOutcome> for UsageValidateResponse {
    fn from(outcome: ValidationOutcome) -> Self {
        Self {
            access: outcome.access,
            usage_id: outcome.usage_id,
            message: outcome.message,
            credits_reserved: outcome.credits_reserved,
            retry_after: outcome.retry_after,
            replayed: outcome.replayed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UsageCommitResponse {
    pub usage_id: Uuid,
    pub status: String,
    pub credits_charged: Option<Decimal>,
    pub committed_at: Option<String>,
    pub replayed: bool,
}

impl UsageCommitResponse {
    pub fn from_outcome(outcome: &CommitOutcome) -> Option<Self> {
        match outcome {
            CommitOutcome::Committed(row) => Some(Self::from_row(row, false)),
            CommitOutcome::Replayed(row) => Some(Self::from_row(row, true)),
            CommitOutcome::NotFound => None,
        }
    }

    fn from_row(row: &UsageLog, replayed: bool) -> Self {
        Self {
            usage_id: row.id,
            status: row.status.clone(),
            credits_charged: row.credits_charged,
            committed_at: row.committed_at.map(|t| t.to_rfc3339()),
            replayed,
        }
    }
}
