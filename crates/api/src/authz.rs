//! API-side authorization guard for commands.
//!
//! This enforces authorization at the command boundary (before dispatch),
//! while keeping domain aggregates and infra auth-agnostic.

use campus_auth::{authorize, AuthzError, CommandAuthorization, Permission, Principal};

use crate::context::PrincipalContext;

/// Check authorization for a command in the current request context.
///
/// This is intended to be called **before** dispatching a command.
pub fn authorize_command<C: CommandAuthorization>(
    principal: &PrincipalContext,
    command: &C,
) -> Result<(), AuthzError> {
    let resolved = Principal {
        user_id: principal.user_id(),
        roles: principal.roles().to_vec(),
        permissions: permissions_from_roles(principal.roles()),
    };

    for perm in command.required_permissions() {
        authorize(&resolved, perm)?;
    }

    Ok(())
}

/// Minimal role→permission mapping.
///
/// Convention: "admin" and "staff" grant all permissions; students hold no
/// command permissions (buying only requires authentication).
fn permissions_from_roles(roles: &[campus_auth::Role]) -> Vec<Permission> {
    if roles
        .iter()
        .any(|r| r.as_str() == "admin" || r.as_str() == "staff")
    {
        return vec![Permission::new("*")];
    }

    Vec::new()
}
