//! Authentication and authorization: JWT issuance and revocation, the
//! role policy, and the request extractor for the authenticated caller.

pub mod rbac;
pub mod tokens;

pub use rbac::{DataType, RbacManager, Role};
pub use tokens::{Claims, TokenKind, TokenManager, TokenPair};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::UserAccount;
use crate::error::Error;

/// Argon2id PHC string with a random salt, the form stored in configuration.
pub fn hash_password(password: &str) -> crate::error::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Config(format!("failed to hash password: {}", e)))
}

/// Check `password` against a stored PHC string. Parameters come from the
/// string itself.
pub fn verify_password(stored: &str, password: &str) -> crate::error::Result<bool> {
    let parsed = PasswordHash::new(stored)
        .map_err(|e| Error::Config(format!("invalid password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Find the configured account matching the credentials.
pub fn authenticate<'a>(users: &'a [UserAccount], username: &str, password: &str) -> Option<&'a UserAccount> {
    let account = users.iter().find(|u| u.username == username)?;
    match verify_password(&account.password_hash, password) {
        Ok(true) => Some(account),
        Ok(false) => None,
        Err(e) => {
            warn!(username, "unusable stored password hash: {}", e);
            None
        }
    }
}

/// Caller identity placed in request extensions by the auth middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
    /// Token id, absent for the development identity.
    pub jti: Option<String>,
}

impl AuthUser {
    /// Identity used for every request when authentication is disabled.
    pub fn development() -> Self {
        Self {
            user_id: "dev".to_string(),
            role: Role::Admin,
            jti: None,
        }
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: claims.role,
            jti: Some(claims.jti),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| Error::Unauthorized("missing credentials".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticates_against_configured_hash() {
        let users = vec![UserAccount {
            id: "u1".into(),
            username: "amal".into(),
            password_hash: hash_password("s3cret").unwrap(),
            role: Role::Agent,
        }];
        assert_eq!(authenticate(&users, "amal", "s3cret").map(|u| u.id.as_str()), Some("u1"));
        assert!(authenticate(&users, "amal", "wrong").is_none());
        assert!(authenticate(&users, "other", "s3cret").is_none());
    }

    #[test]
    fn hashes_are_salted_phc_strings() {
        let a = hash_password("same-password").unwrap();
        let b = hash_password("same-password").unwrap();
        assert!(a.starts_with("$argon2id$"));
        assert_ne!(a, b);
        assert!(verify_password(&a, "same-password").unwrap());
        assert!(verify_password(&b, "same-password").unwrap());
        assert!(!verify_password(&a, "other").unwrap());
    }

    #[test]
    fn malformed_stored_hash_never_authenticates() {
        let users = vec![UserAccount {
            id: "u1".into(),
            username: "amal".into(),
            password_hash: "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8".into(),
            role: Role::Agent,
        }];
        assert!(verify_password(&users[0].password_hash, "password").is_err());
        assert!(authenticate(&users, "amal", "password").is_none());
    }
}
