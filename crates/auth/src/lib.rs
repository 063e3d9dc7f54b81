//! `pulse-auth` — authentication/authorization boundary.
//!
//! Claim validation and the permission check are pure; only the HS256
//! validator in `jwt` touches cryptography, and nothing here touches HTTP or
//! storage.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, CommandAuthorization, Principal, authorize, role_permissions};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator};
pub use permissions::Permission;
pub use principal::{PrincipalId, TenantMembership};
pub use roles::Role;
