//! API-side authorization guard for commands.
//!
//! Enforced at the command boundary, before dispatch; aggregates and infra
//! stay auth-agnostic.

use pulse_auth::{
    AuthzError, CommandAuthorization, Principal, TenantMembership, authorize, role_permissions,
};

use crate::context::{PrincipalContext, TenantContext};

/// Check authorization for a command in the current request context.
pub fn authorize_command<C: CommandAuthorization>(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    command: &C,
) -> Result<(), AuthzError> {
    let permissions = principal
        .roles()
        .iter()
        .flat_map(role_permissions)
        .collect();

    let membership = TenantMembership {
        tenant_id: tenant.tenant_id(),
        roles: principal.roles().to_vec(),
        permissions,
    };

    let principal = Principal {
        principal_id: principal.principal_id(),
        active_tenant_id: tenant.tenant_id(),
        membership,
    };

    for perm in command.required_permissions() {
        authorize(&principal, perm)?;
    }

    Ok(())
}
