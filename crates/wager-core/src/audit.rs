//! Append-only admin audit log: a global hash chain sibling to the money ledger.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Denied,
    Failed,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }
}

/// Audit event before the store assigns its chain position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditAppend {
    pub actor_id: String,
    pub action: String,
    pub resource: String,
    pub status: AuditStatus,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditAppend {
    pub fn new(
        actor_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        status: AuditStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            action: action.into(),
            resource: resource.into(),
            status,
            detail: detail.into(),
            recorded_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub fn success(
        actor_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(actor_id, action, resource, AuditStatus::Success, detail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub sequence: u64,
    pub actor_id: String,
    pub action: String,
    pub resource: String,
    pub status: AuditStatus,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// Link an event onto the chain whose latest record is `previous`.
pub fn seal_audit(event: AuditAppend, previous: Option<&AuditRecord>) -> AuditRecord {
    let sequence = previous.map(|record| record.sequence + 1).unwrap_or(1);
    let previous_hash = previous.map(|record| record.hash.clone());
    let mut record = AuditRecord {
        sequence,
        actor_id: event.actor_id,
        action: event.action,
        resource: event.resource,
        status: event.status,
        detail: event.detail,
        recorded_at: event.recorded_at,
        previous_hash,
        hash: String::new(),
    };
    record.hash = compute_audit_hash(&record);
    record
}

pub fn verify_audit_chain(records: &[AuditRecord]) -> bool {
    let mut previous: Option<&AuditRecord> = None;
    for record in records {
        let expected_sequence = previous.map(|p| p.sequence + 1).unwrap_or(1);
        if record.sequence != expected_sequence
            || record.previous_hash.as_deref() != previous.map(|p| p.hash.as_str())
            || record.hash != compute_audit_hash(record)
        {
            return false;
        }
        previous = Some(record);
    }
    true
}

fn compute_audit_hash(record: &AuditRecord) -> String {
    let material = serde_json::json!({
        "sequence": record.sequence,
        "actor_id": record.actor_id,
        "action": record.action,
        "resource": record.resource,
        "status": record.status,
        "detail": record.detail,
        "recorded_at": record.recorded_at,
        "previous_hash": record.previous_hash,
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_and_detects_edits() {
        let first = seal_audit(
            AuditAppend::success("admin-1", "manual_payout", "user:alice", "amount=500"),
            None,
        );
        let second = seal_audit(
            AuditAppend::new(
                "user-9",
                "void_bet",
                "slip:abc",
                AuditStatus::Denied,
                "role user",
            ),
            Some(&first),
        );
        assert_eq!(second.sequence, 2);
        assert!(verify_audit_chain(&[first.clone(), second.clone()]));

        let mut edited = first;
        edited.detail = "amount=5".to_string();
        assert!(!verify_audit_chain(&[edited, second]));
    }
}
