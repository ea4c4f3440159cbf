//! Feature cost configuration model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Product a feature key belongs to, derived from the key's namespace
/// prefix. Never set independently of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Api,
    Career,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Api => "api",
            ProductType::Career => "career",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "career" => ProductType::Career,
            _ => ProductType::Api,
        }
    }
}

/// Namespaced feature key, e.g. `api.job_match` or `career.extract_keywords`.
///
/// The segment before the first dot is the product namespace; the rest
/// names the operation within that product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct FeatureKey(String);

impl FeatureKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Product derived from the key's namespace prefix.
    pub fn product_type(&self) -> ProductType {
        match self.0.split('.').next() {
            Some("career") => ProductType::Career,
            _ => ProductType::Api,
        }
    }
}

impl std::str::FromStr for FeatureKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, rest) = s
            .split_once('.')
            .ok_or_else(|| format!("Feature key '{}' has no product namespace", s))?;
        if rest.is_empty() {
            return Err(format!("Feature key '{}' has an empty operation name", s));
        }
        match namespace {
            "api" | "career" => Ok(FeatureKey(s.to_string())),
            other => Err(format!("Unknown product namespace '{}'", other)),
        }
    }
}

impl std::fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-feature credit cost row. One row per feature key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeatureCostConfig {
    pub id: Uuid,
    pub feature_key: FeatureKey,
    pub product_type: String,
    pub internal_cost_credits: Decimal,
    pub is_deleted: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating or updating a feature cost row.
#[derive(Debug, Clone)]
pub struct UpsertFeatureCost {
    pub feature_key: FeatureKey,
    pub internal_cost_credits: Decimal,
}
