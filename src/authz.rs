// Authorization Resolver
//
// The authenticated boundary hands the core a typed role set resolved once
// per operation; there is no implicit role lookup anywhere else. A static
// table maps every state-changing action to the roles allowed to invoke
// it, and accountants are additionally scoped to the parties assigned to
// them through a read-only lookup.

use std::collections::{HashMap, HashSet};

use crate::error::{CoreError, CoreResult};

// ============================================================================
// ROLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Supervisor,
    Accountant,
    Shareholder,
    Investor,
}

/// Priority order for choosing the active role when an actor holds several.
pub const ROLE_PRIORITY: [Role; 5] = [
    Role::Admin,
    Role::Supervisor,
    Role::Accountant,
    Role::Shareholder,
    Role::Investor,
];

impl Role {
    /// Legacy role code as stored by the identity provider
    pub fn code(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN_TI",
            Role::Supervisor => "SUPERVISOR",
            Role::Accountant => "ANALISTA",
            Role::Shareholder => "ACCIONISTA",
            Role::Investor => "INVERSIONISTA",
        }
    }

    pub fn from_code(code: &str) -> Option<Role> {
        match code {
            "ADMIN_TI" => Some(Role::Admin),
            "SUPERVISOR" => Some(Role::Supervisor),
            "ANALISTA" => Some(Role::Accountant),
            "ACCIONISTA" => Some(Role::Shareholder),
            "INVERSIONISTA" => Some(Role::Investor),
            _ => None,
        }
    }
}

/// Highest-priority role within a role set.
pub fn primary_role(roles: &HashSet<Role>) -> Option<Role> {
    ROLE_PRIORITY.iter().copied().find(|r| roles.contains(r))
}

// ============================================================================
// ACTOR
// ============================================================================

/// Actor identity as supplied by the identity provider for one operation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: i64,
    pub roles: HashSet<Role>,
    /// An inactive actor is treated as unauthenticated: all actions denied
    pub is_active: bool,
}

impl Actor {
    pub fn new(id: i64, roles: impl IntoIterator<Item = Role>) -> Self {
        Actor {
            id,
            roles: roles.into_iter().collect(),
            is_active: true,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

// ============================================================================
// ACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTag {
    CreateRating,
    UpdateRating,
    VoidRating,
    RestoreRating,
    SubmitBatch,
    MarkBatchFailed,
    RequestApproval,
    ResolveApproval,
    ViewAuditTrail,
    ExportRatings,
    ManageParties,
}

/// Static permission table: which roles may invoke which action.
pub fn allowed_roles(action: ActionTag) -> &'static [Role] {
    match action {
        ActionTag::CreateRating | ActionTag::UpdateRating | ActionTag::VoidRating => {
            &[Role::Accountant, Role::Supervisor, Role::Admin]
        }
        ActionTag::RestoreRating => &[Role::Supervisor, Role::Admin],
        ActionTag::SubmitBatch => &[Role::Accountant, Role::Supervisor, Role::Admin],
        ActionTag::MarkBatchFailed => &[Role::Admin],
        ActionTag::RequestApproval => &[Role::Accountant, Role::Supervisor, Role::Admin],
        ActionTag::ResolveApproval => &[Role::Supervisor, Role::Admin],
        ActionTag::ViewAuditTrail => &[Role::Supervisor, Role::Admin],
        ActionTag::ExportRatings => &[Role::Accountant, Role::Supervisor, Role::Admin],
        ActionTag::ManageParties => &[Role::Admin],
    }
}

/// Allow or deny an action for an actor. Deny short-circuits before any
/// store mutation.
pub fn authorize(actor: &Actor, action: ActionTag) -> CoreResult<()> {
    if !actor.is_active {
        return Err(CoreError::Authorization);
    }
    if allowed_roles(action).iter().any(|r| actor.has_role(*r)) {
        Ok(())
    } else {
        Err(CoreError::Authorization)
    }
}

// ============================================================================
// ACCOUNTANT SCOPING
// ============================================================================

/// Read-only lookup of the parties an accountant is assigned to. The
/// assignment relationship lives outside the core.
pub trait ScopeLookup: Send + Sync {
    fn parties_for(&self, actor_id: i64) -> CoreResult<HashSet<i64>>;
}

/// Fixed assignment map, for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticScope {
    assignments: HashMap<i64, HashSet<i64>>,
}

impl StaticScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, actor_id: i64, party_id: i64) -> Self {
        self.assignments.entry(actor_id).or_default().insert(party_id);
        self
    }
}

impl ScopeLookup for StaticScope {
    fn parties_for(&self, actor_id: i64) -> CoreResult<HashSet<i64>> {
        Ok(self.assignments.get(&actor_id).cloned().unwrap_or_default())
    }
}

/// Party-level check for accountants. Admins and supervisors act on any
/// party; an accountant must hold an active assignment to the party.
/// `scope = None` means no assignment table is configured and accountants
/// are unrestricted.
pub fn authorize_party(
    actor: &Actor,
    party_id: i64,
    scope: Option<&dyn ScopeLookup>,
) -> CoreResult<()> {
    if actor.has_role(Role::Admin) || actor.has_role(Role::Supervisor) {
        return Ok(());
    }
    match scope {
        None => Ok(()),
        Some(scope) if scope.parties_for(actor.id)?.contains(&party_id) => Ok(()),
        Some(_) => Err(CoreError::Authorization),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_codes_roundtrip() {
        for role in ROLE_PRIORITY {
            assert_eq!(Role::from_code(role.code()), Some(role));
        }
        assert_eq!(Role::from_code("GERENTE"), None);
    }

    #[test]
    fn test_primary_role_uses_priority() {
        let roles: HashSet<Role> = [Role::Investor, Role::Supervisor].into_iter().collect();
        assert_eq!(primary_role(&roles), Some(Role::Supervisor));

        let roles: HashSet<Role> = [Role::Shareholder].into_iter().collect();
        assert_eq!(primary_role(&roles), Some(Role::Shareholder));

        assert_eq!(primary_role(&HashSet::new()), None);
    }

    #[test]
    fn test_inactive_actor_denied_everything() {
        let mut actor = Actor::new(1, [Role::Admin]);
        actor.is_active = false;

        assert!(matches!(
            authorize(&actor, ActionTag::CreateRating),
            Err(CoreError::Authorization)
        ));
        assert!(matches!(
            authorize(&actor, ActionTag::ViewAuditTrail),
            Err(CoreError::Authorization)
        ));
    }

    #[test]
    fn test_permission_table() {
        let accountant = Actor::new(1, [Role::Accountant]);
        let supervisor = Actor::new(2, [Role::Supervisor]);
        let investor = Actor::new(3, [Role::Investor]);

        assert!(authorize(&accountant, ActionTag::CreateRating).is_ok());
        assert!(authorize(&accountant, ActionTag::SubmitBatch).is_ok());
        assert!(authorize(&accountant, ActionTag::ResolveApproval).is_err());
        assert!(authorize(&accountant, ActionTag::RestoreRating).is_err());

        assert!(authorize(&supervisor, ActionTag::ResolveApproval).is_ok());
        assert!(authorize(&supervisor, ActionTag::VoidRating).is_ok());
        assert!(authorize(&supervisor, ActionTag::ManageParties).is_err());

        assert!(authorize(&investor, ActionTag::CreateRating).is_err());
        assert!(authorize(&investor, ActionTag::SubmitBatch).is_err());
    }

    #[test]
    fn test_accountant_party_scoping() {
        let accountant = Actor::new(10, [Role::Accountant]);
        let scope = StaticScope::new().assign(10, 5);

        assert!(authorize_party(&accountant, 5, Some(&scope)).is_ok());
        assert!(matches!(
            authorize_party(&accountant, 6, Some(&scope)),
            Err(CoreError::Authorization)
        ));
        // No assignment table configured at all
        assert!(authorize_party(&accountant, 6, None).is_ok());
    }

    #[test]
    fn test_supervisor_bypasses_scoping() {
        let supervisor = Actor::new(11, [Role::Supervisor]);
        let scope = StaticScope::new();
        assert!(authorize_party(&supervisor, 99, Some(&scope)).is_ok());
    }
}
