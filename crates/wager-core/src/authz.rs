//! Single capability check for privileged operations.

use crate::audit::{AuditAppend, AuditStatus};
use crate::error::WagerError;
use crate::store::{WagerResult, WagerStore};
use crate::types::{Caller, Role};
use tracing::warn;

pub const ADMIN_ROLES: &[Role] = &[Role::Admin, Role::Superadmin];
pub const SUPERADMIN_ONLY: &[Role] = &[Role::Superadmin];

/// Pure role check.
pub fn require_role(caller: &Caller, allowed: &[Role], action: &str) -> Result<(), WagerError> {
    if allowed.contains(&caller.role) {
        Ok(())
    } else {
        Err(WagerError::Unauthorized {
            caller: caller.user_id.clone(),
            action: action.to_string(),
        })
    }
}

/// Role check that leaves a `denied` audit record behind on failure.
pub async fn authorize(
    store: &dyn WagerStore,
    caller: &Caller,
    allowed: &[Role],
    action: &str,
    resource: &str,
) -> WagerResult<()> {
    let Err(denied) = require_role(caller, allowed, action) else {
        return Ok(());
    };

    warn!(
        caller = %caller.user_id,
        role = caller.role.as_str(),
        action,
        resource,
        "privileged action denied"
    );
    let record = AuditAppend::new(
        caller.user_id.clone(),
        action,
        resource,
        AuditStatus::Denied,
        format!("role '{}' not permitted", caller.role.as_str()),
    );
    if let Err(err) = store.append_audit(record).await {
        warn!(error = %err, action, "failed to record denied attempt");
    }
    Err(denied)
}
