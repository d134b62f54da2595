//! Approval tokens: opaque, time-bounded, single-purpose. A token binds one
//! `approval_id` to the approver role that may spend it; the expiry is
//! embedded so validation needs no database read.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Invalid,
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Invalid => write!(f, "approval token is invalid"),
            TokenError::Expired => write!(f, "approval token has expired"),
        }
    }
}

impl std::error::Error for TokenError {}

pub fn mint(
    secret: &[u8],
    approval_id: Uuid,
    approver_role: &str,
    expires_at: DateTime<Utc>,
) -> String {
    let expiry = expires_at.timestamp();
    let mac = sign(secret, approval_id, approver_role, expiry);
    format!("{}.{}.{}", VERSION, expiry, hex::encode(mac))
}

pub fn verify(
    secret: &[u8],
    token: &str,
    approval_id: Uuid,
    approver_role: &str,
    now: DateTime<Utc>,
) -> Result<(), TokenError> {
    let mut parts = token.splitn(3, '.');
    let version = parts.next().ok_or(TokenError::Invalid)?;
    let expiry_str = parts.next().ok_or(TokenError::Invalid)?;
    let mac_hex = parts.next().ok_or(TokenError::Invalid)?;

    if version != VERSION {
        return Err(TokenError::Invalid);
    }

    let expiry: i64 = expiry_str.parse().map_err(|_| TokenError::Invalid)?;
    let mac_bytes = hex::decode(mac_hex).map_err(|_| TokenError::Invalid)?;

    let mut verifier = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::Invalid)?;
    verifier.update(message(approval_id, approver_role, expiry).as_bytes());
    verifier
        .verify_slice(&mac_bytes)
        .map_err(|_| TokenError::Invalid)?;

    // Expiry is checked after authenticity so a forged expiry cannot change
    // the error class.
    if now.timestamp() >= expiry {
        return Err(TokenError::Expired);
    }

    Ok(())
}

fn sign(secret: &[u8], approval_id: Uuid, approver_role: &str, expiry: i64) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message(approval_id, approver_role, expiry).as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn message(approval_id: Uuid, approver_role: &str, expiry: i64) -> String {
    format!("{}|{}|{}", approval_id, approver_role, expiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const SECRET: &[u8] = b"test-approval-secret";

    #[test]
    fn minted_token_verifies_until_expiry() {
        let approval_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now + TimeDelta::hours(24);

        let token = mint(SECRET, approval_id, "admin", expires_at);
        verify(SECRET, &token, approval_id, "admin", now).expect("fresh token should verify");

        let err = verify(SECRET, &token, approval_id, "admin", expires_at).unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn token_is_bound_to_approval_id_and_role() {
        let approval_id = Uuid::new_v4();
        let now = Utc::now();
        let token = mint(SECRET, approval_id, "admin", now + TimeDelta::hours(1));

        let err = verify(SECRET, &token, Uuid::new_v4(), "admin", now).unwrap_err();
        assert_eq!(err, TokenError::Invalid);

        let err = verify(SECRET, &token, approval_id, "data_analyst", now).unwrap_err();
        assert_eq!(err, TokenError::Invalid);
    }

    #[test]
    fn tampered_expiry_is_invalid_not_expired() {
        let approval_id = Uuid::new_v4();
        let now = Utc::now();
        let token = mint(SECRET, approval_id, "admin", now + TimeDelta::seconds(1));

        // Push the embedded expiry into the future without re-signing.
        let mut parts = token.splitn(3, '.');
        let version = parts.next().expect("version");
        let _expiry = parts.next().expect("expiry");
        let mac = parts.next().expect("mac");
        let forged = format!("{}.{}.{}", version, (now + TimeDelta::days(30)).timestamp(), mac);

        let err = verify(SECRET, &forged, approval_id, "admin", now).unwrap_err();
        assert_eq!(err, TokenError::Invalid);
    }

    #[test]
    fn wrong_secret_and_garbage_are_invalid() {
        let approval_id = Uuid::new_v4();
        let now = Utc::now();
        let token = mint(SECRET, approval_id, "admin", now + TimeDelta::hours(1));

        let err = verify(b"other-secret", &token, approval_id, "admin", now).unwrap_err();
        assert_eq!(err, TokenError::Invalid);

        for garbage in ["", "v1", "v1.x.y", "v2.123.abcd", "not-a-token"] {
            let err = verify(SECRET, garbage, approval_id, "admin", now).unwrap_err();
            assert_eq!(err, TokenError::Invalid, "{} should be invalid", garbage);
        }
    }
}
