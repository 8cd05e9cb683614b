use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentops_core::WorkspaceId;

/// Billing-derived status of a workspace plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Expired,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementStatus::Active => "active",
            EntitlementStatus::Trialing => "trialing",
            EntitlementStatus::PastDue => "past_due",
            EntitlementStatus::Canceled => "canceled",
            EntitlementStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(EntitlementStatus::Active),
            "trialing" => Some(EntitlementStatus::Trialing),
            "past_due" => Some(EntitlementStatus::PastDue),
            "canceled" => Some(EntitlementStatus::Canceled),
            "expired" => Some(EntitlementStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// A workspace's current plan/billing-derived capability record.
///
/// Computed elsewhere; the orchestrator only requires that an active record
/// exists. Numeric limits are carried but not enforced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub workspace_id: WorkspaceId,
    pub plan_code: String,
    pub status: EntitlementStatus,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    pub period: BillingPeriod,
}

impl Entitlement {
    pub fn active(workspace_id: WorkspaceId, plan_code: impl Into<String>, period: BillingPeriod) -> Self {
        Self {
            workspace_id,
            plan_code: plan_code.into(),
            status: EntitlementStatus::Active,
            limits: BTreeMap::new(),
            features: BTreeMap::new(),
            period,
        }
    }

    pub fn with_status(mut self, status: EntitlementStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_limit(mut self, name: impl Into<String>, value: i64) -> Self {
        self.limits.insert(name.into(), value);
        self
    }

    pub fn with_feature(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.features.insert(name.into(), enabled);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == EntitlementStatus::Active
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}
