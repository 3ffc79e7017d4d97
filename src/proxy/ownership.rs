use tracing::{debug, warn};

use crate::sandbox::{CallerContext, CanonicalId, SandboxRegistry};

/// Whether `caller` may reach sandbox `id`.
///
/// True only when a persisted record ties the sandbox to the caller, or the
/// caller's session already names this exact id. Anything else is denied,
/// including registry errors. A running unit alone proves nothing.
pub fn resolve_ownership(
    registry: &SandboxRegistry,
    id: &CanonicalId,
    caller: &CallerContext,
) -> bool {
    match registry.record(id) {
        Ok(Some(record)) if record.is_owned_by(caller) => return true,
        Ok(_) => {}
        Err(e) => warn!("Ownership lookup for {} failed: {}", id, e),
    }
    let by_session = caller.session_sandbox.as_deref() == Some(id.as_str());
    if !by_session {
        debug!("Denying access to {} for {:?}", id, caller.user_id);
    }
    by_session
}
