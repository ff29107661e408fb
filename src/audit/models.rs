//! Audit data models

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Default number of audit entries returned per query
pub const DEFAULT_AUDIT_QUERY_LIMIT: usize = 50;

/// Maximum number of audit entries that can be returned in a single query.
pub const MAX_AUDIT_QUERY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "audit_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    JobCreated,
    JobCompleted,
    JobFailed,
    JobResubmitted,
    SubmissionRejected,
    SubmissionFailed,
    CsrfViolation,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "import.job_created",
            Self::JobCompleted => "import.job_completed",
            Self::JobFailed => "import.job_failed",
            Self::JobResubmitted => "import.job_resubmitted",
            Self::SubmissionRejected => "import.submission_rejected",
            Self::SubmissionFailed => "import.submission_failed",
            Self::CsrfViolation => "security.csrf_violation",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entity types that can be audited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    ImportJob,
    ImportSubmission,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImportJob => "import_job",
            Self::ImportSubmission => "import_submission",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit log entry as stored. Entries are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    #[schemars(with = "String")]
    pub id: Uuid,
    pub action: String,
    pub user_id: Option<String>,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub metadata: JsonValue,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn builder(action: AuditAction, entity_type: EntityType, severity: Severity) -> AuditEntryBuilder {
        AuditEntryBuilder {
            action,
            entity_type,
            severity,
            user_id: None,
            entity_id: None,
            metadata: Map::new(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntryBuilder {
    action: AuditAction,
    entity_type: EntityType,
    severity: Severity,
    user_id: Option<String>,
    entity_id: Option<String>,
    metadata: Map<String, JsonValue>,
}

impl AuditEntryBuilder {
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn entity(mut self, entity_id: impl ToString) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            action: self.action.as_str().to_string(),
            user_id: self.user_id,
            entity_type: self.entity_type.as_str().to_string(),
            entity_id: self.entity_id,
            metadata: JsonValue::Object(self.metadata),
            severity: self.severity,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_entry() {
        let entry = AuditLogEntry::builder(AuditAction::CsrfViolation, EntityType::ImportSubmission, Severity::High)
            .user("admin-1")
            .meta("reason", "csrf token mismatch")
            .build();

        assert_eq!(entry.action, "security.csrf_violation");
        assert_eq!(entry.entity_type, "import_submission");
        assert_eq!(entry.user_id.as_deref(), Some("admin-1"));
        assert_eq!(entry.metadata_str("reason"), Some("csrf token mismatch"));
        assert!(entry.entity_id.is_none());
    }

    #[test]
    fn severities_order_by_weight() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
