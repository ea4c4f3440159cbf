//! Usage ledger model.

use crate::models::FeatureKey;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Admission decision recorded on a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Granted,
    Denied,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Granted => "granted",
            AccessStatus::Denied => "denied",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "granted" => AccessStatus::Granted,
            _ => AccessStatus::Denied,
        }
    }
}

/// Ledger row lifecycle. PENDING is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLogStatus {
    Pending,
    Success,
    Failed,
    Expired,
}

impl UsageLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageLogStatus::Pending => "pending",
            UsageLogStatus::Success => "success",
            UsageLogStatus::Failed => "failed",
            UsageLogStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "success" => UsageLogStatus::Success,
            "failed" => UsageLogStatus::Failed,
            "expired" => UsageLogStatus::Expired,
            _ => UsageLogStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UsageLogStatus::Pending)
    }
}

/// Failure classification required when committing with success=false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    InternalError,
    Timeout,
    RateLimited,
    InvalidResponse,
    UpstreamError,
    ClientError,
    ValidationError,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::InternalError => "internal_error",
            FailureType::Timeout => "timeout",
            FailureType::RateLimited => "rate_limited",
            FailureType::InvalidResponse => "invalid_response",
            FailureType::UpstreamError => "upstream_error",
            FailureType::ClientError => "client_error",
            FailureType::ValidationError => "validation_error",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "timeout" => FailureType::Timeout,
            "rate_limited" => FailureType::RateLimited,
            "invalid_response" => FailureType::InvalidResponse,
            "upstream_error" => FailureType::UpstreamError,
            "client_error" => FailureType::ClientError,
            "validation_error" => FailureType::ValidationError,
            _ => FailureType::InternalError,
        }
    }
}

/// One metered request. Reserved at validation time, settled by commit
/// or swept to expired.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageLog {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub request_id: String,
    pub fingerprint_hash: String,
    pub feature_key: FeatureKey,
    pub endpoint: String,
    pub method: String,
    pub access_status: String,
    pub status: String,
    pub credits_reserved: Decimal,
    pub credits_charged: Option<Decimal>,
    pub model_used: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub latency_ms: Option<i32>,
    pub failure_type: Option<String>,
    pub failure_reason: Option<String>,
    pub client_ip: Option<String>,
    pub client_user_agent: Option<String>,
    pub usage_estimate: Option<serde_json::Value>,
    pub committed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsageLog {
    pub fn status(&self) -> UsageLogStatus {
        UsageLogStatus::from_string(&self.status)
    }

    pub fn access_status(&self) -> AccessStatus {
        AccessStatus::from_string(&self.access_status)
    }
}

/// Input for reserving a ledger row at validation time.
#[derive(Debug, Clone)]
pub struct CreateUsageLog {
    pub owner_id: Uuid,
    pub request_id: String,
    pub fingerprint_hash: String,
    pub feature_key: FeatureKey,
    pub endpoint: String,
    pub method: String,
    pub access_status: AccessStatus,
    pub credits_reserved: Decimal,
    pub client_ip: Option<String>,
    pub client_user_agent: Option<String>,
    pub usage_estimate: Option<serde_json::Value>,
}

/// Optional execution metrics merged into a row on successful commit.
/// Each field is written only when provided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub model_used: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub latency_ms: Option<i32>,
}

/// Required failure details for a failed commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetails {
    pub failure_type: FailureType,
    pub reason: String,
}
