//! Sandbox identity, addressing and ownership registry.

pub mod address;
pub mod identity;
pub mod registry;
pub mod store;

use serde::Serialize;

pub use address::{AccessRecorder, AddressResolver, AddressingStrategy, Subnet};
pub use identity::{canonicalize, container_name, CanonicalId, NamingScheme, UnitNamer};
pub use registry::{
    RegistryError, RegistryOptions, SandboxRecord, SandboxRegistry, TeardownReport, TeardownStep,
};
pub use store::{KvStore, MemoryStore};

/// Who is asking. Built once per request by the caller and passed explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: Option<i64>,
    pub public_id: Option<String>,
    pub is_admin: bool,
    /// Admins opt back into isolation with this flag.
    pub force_sandbox: bool,
    /// Sandbox id already bound to the caller's session, if any.
    pub session_sandbox: Option<String>,
}

impl CallerContext {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    /// Whether isolation is skipped for this caller.
    pub fn is_unconstrained(&self) -> bool {
        self.is_admin && !self.force_sandbox
    }

    /// Whether the caller carries any identity a record can be keyed by.
    pub fn has_identity(&self) -> bool {
        self.user_id.is_some() || self.public_id.is_some()
    }
}

/// Decided once per request and threaded through every sandbox operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "isolation", content = "sandbox_id", rename_all = "lowercase")]
pub enum Isolation {
    Sandboxed(CanonicalId),
    /// No isolation applies (administrators working on the host project).
    Unconstrained,
}

impl Isolation {
    pub fn sandbox_id(&self) -> Option<&CanonicalId> {
        match self {
            Isolation::Sandboxed(id) => Some(id),
            Isolation::Unconstrained => None,
        }
    }
}
