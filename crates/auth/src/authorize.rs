use std::collections::HashSet;

use thiserror::Error;

use pulse_core::TenantId;

use crate::{Permission, PrincipalId, Role, TenantMembership};

/// A fully resolved principal for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub active_tenant_id: TenantId,
    pub membership: TenantMembership,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Command-side authorization contract, checked before dispatch.
pub trait CommandAuthorization {
    fn required_permissions(&self) -> &[Permission];
}

/// Pure policy check: no IO, no panics, no business logic.
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.active_tenant_id != principal.membership.tenant_id {
        return Err(AuthzError::TenantMismatch);
    }

    let perms: HashSet<&str> = principal
        .membership
        .permissions
        .iter()
        .map(|p| p.as_str())
        .collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Built-in role→permission mapping.
///
/// Intentionally static until a policy store exists. `admin` gets the
/// wildcard; the remaining roles are scoped to indicator work.
pub fn role_permissions(role: &Role) -> Vec<Permission> {
    match role.as_str() {
        "admin" => vec![Permission::new("*")],
        "manager" => vec![
            Permission::new("indicators.define"),
            Permission::new("indicators.revise"),
            Permission::new("indicators.retire"),
            Permission::new("indicators.record"),
            Permission::new("indicators.read"),
            Permission::new("admin.jobs"),
        ],
        "analyst" => vec![
            Permission::new("indicators.record"),
            Permission::new("indicators.read"),
        ],
        "viewer" => vec![Permission::new("indicators.read")],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(tenant: TenantId, permissions: Vec<Permission>) -> Principal {
        Principal {
            principal_id: PrincipalId::new(),
            active_tenant_id: tenant,
            membership: TenantMembership {
                tenant_id: tenant,
                roles: vec![],
                permissions,
            },
        }
    }

    #[test]
    fn wildcard_grants_everything() {
        let tenant = TenantId::new();
        let p = principal(tenant, vec![Permission::new("*")]);
        assert!(authorize(&p, &Permission::new("indicators.retire")).is_ok());
    }

    #[test]
    fn explicit_permission_grants() {
        let tenant = TenantId::new();
        let p = principal(tenant, vec![Permission::new("indicators.read")]);
        assert!(authorize(&p, &Permission::new("indicators.read")).is_ok());
        assert_eq!(
            authorize(&p, &Permission::new("indicators.record")),
            Err(AuthzError::Forbidden("indicators.record".to_string()))
        );
    }

    #[test]
    fn cross_tenant_membership_rejected() {
        let p = Principal {
            principal_id: PrincipalId::new(),
            active_tenant_id: TenantId::new(),
            membership: TenantMembership {
                tenant_id: TenantId::new(),
                roles: vec![],
                permissions: vec![Permission::new("*")],
            },
        };
        assert_eq!(
            authorize(&p, &Permission::new("indicators.read")),
            Err(AuthzError::TenantMismatch)
        );
    }

    #[test]
    fn role_mapping_scopes_non_admin_roles() {
        let analyst = role_permissions(&Role::new("analyst"));
        assert!(analyst.iter().any(|p| p.as_str() == "indicators.record"));
        assert!(!analyst.iter().any(|p| p.is_wildcard()));

        let unknown = role_permissions(&Role::new("intern"));
        assert!(unknown.is_empty());
    }
}
