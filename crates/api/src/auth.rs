//! Identity-provider token verification
//!
//! Identity and organization membership come from an external provider; this
//! module only verifies the tokens it issues and enforces the per-operation
//! role allow-lists. There is no local credential storage.

use axum::{async_trait, extract::FromRequestParts, http::header, http::request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Role within an organization, as asserted by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Staff,
    Promoter,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "staff" => Some(Self::Staff),
            "promoter" => Some(Self::Promoter),
            _ => None,
        }
    }
}

/// Claims in an identity-provider token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Organization ID
    pub org_id: Uuid,
    /// Role within the organization
    pub role: String,
    /// Expiration
    pub exp: i64,
}

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: Role,
}

impl Identity {
    /// Enforce an operation-specific role allow-list
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let decoded = decode::<IdentityClaims>(
            token,
            &DecodingKey::from_secret(state.config.identity_jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Identity token verification failed");
            ApiError::InvalidToken
        })?;

        let role = Role::parse(&decoded.claims.role).ok_or(ApiError::InvalidToken)?;

        Ok(Identity {
            user_id: decoded.claims.sub,
            org_id: decoded.claims.org_id,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("owner"), Some(Role::Owner));
        assert_eq!(Role::parse("STAFF"), Some(Role::Staff));
        assert_eq!(Role::parse("member"), None);
    }

    #[test]
    fn test_require_role() {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            role: Role::Staff,
        };
        assert!(identity
            .require_role(&[Role::Owner, Role::Admin, Role::Staff])
            .is_ok());
        assert!(identity.require_role(&[Role::Owner]).is_err());
    }
}
