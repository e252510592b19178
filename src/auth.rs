//! # Bearer Token Issuance & Verification
//!
//! Opaque bearer tokens carry `(user_id, role_id, expiry)` as HS256 JWT
//! claims. `role_id == 0` is admin; anything else is a tenant. The same
//! secret authenticates both the admin/tenant JSON API and admin
//! WebSocket observer connections (`?type=0&secret=<jwt>`).

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub user_id: i64,
    pub role_id: i64,
    pub exp: usize,
    pub iat: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role_id == 0
    }
}

/// Signs a new bearer token for `(user_id, role_id)`, valid for `ttl`.
pub fn sign(secret: &[u8], user_id: i64, role_id: i64, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let claims = Claims {
        user_id,
        role_id,
        iat: now.as_secs() as usize,
        exp: (now + ttl).as_secs() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Parses and verifies a bearer token, rejecting anything expired or
/// signed with a different secret/algorithm.
pub fn parse(secret: &[u8], token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::new(jsonwebtoken::Algorithm::HS256),
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_parse_round_trip() {
        let secret = b"test-secret";
        let token = sign(secret, 7, 1, Duration::from_secs(3600)).unwrap();
        let claims = parse(secret, &token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.role_id, 1);
        assert!(!claims.is_admin());
    }

    #[test]
    fn admin_role_detected() {
        let secret = b"test-secret";
        let token = sign(secret, 1, 0, Duration::from_secs(3600)).unwrap();
        let claims = parse(secret, &token).unwrap();
        assert!(claims.is_admin());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = sign(b"secret-a", 1, 0, Duration::from_secs(3600)).unwrap();
        assert!(parse(b"secret-b", &token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let secret = b"test-secret";
        let claims = Claims {
            user_id: 1,
            role_id: 0,
            iat: 0,
            exp: 1,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap();
        assert!(parse(secret, &token).is_err());
    }
}
