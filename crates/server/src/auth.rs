use anyhow::{anyhow, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

/// Key material for the bearer credential handed out at login and
/// presented once at connection time.
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    exp: i64,
}

impl AuthKeys {
    pub fn new(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_seconds,
        }
    }

    pub fn mint_token(&self, user_id: UserId) -> Result<String> {
        let claims = Claims {
            sub: user_id.0,
            exp: Utc::now().timestamp() + self.ttl_seconds,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(Into::into)
    }

    /// Fail-closed: any malformed, mis-signed, or expired token is an
    /// error, and the connection must be rejected before any registry
    /// binding happens.
    pub fn verify_token(&self, token: &str) -> Result<UserId> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| anyhow!("invalid bearer token: {e}"))?;
        Ok(UserId(data.claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_verify_back_to_the_user() {
        let keys = AuthKeys::new("secret", 60);
        let token = keys.mint_token(UserId(42)).expect("mint");
        assert_eq!(keys.verify_token(&token).expect("verify"), UserId(42));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let minting = AuthKeys::new("secret-a", 60);
        let verifying = AuthKeys::new("secret-b", 60);
        let token = minting.mint_token(UserId(42)).expect("mint");
        assert!(verifying.verify_token(&token).is_err());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let keys = AuthKeys::new("secret", 60);
        assert!(keys.verify_token("not-a-jwt").is_err());
    }
}
