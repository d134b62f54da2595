//! Authoritative identity lookup. Role and region come from
//! `internal.users`, never from the envelope; a row that fails the identity
//! invariant is treated as unknown.

use sqlx::Row;

use datagate_contracts::{Identity, Region, Role};

#[derive(Clone)]
pub struct IdentityStore {
    pool: sqlx::PgPool,
}

impl IdentityStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, external_user_id: &str) -> Result<Option<Identity>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT external_user_id, display_name, role, region FROM internal.users WHERE external_user_id = $1",
        )
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let role_raw: String = row.try_get("role")?;
        let Some(role) = Role::parse(&role_raw) else {
            tracing::warn!(
                external_user_id = %external_user_id,
                role = %role_raw,
                "gateway.identity_unknown_role"
            );
            return Ok(None);
        };

        let region_raw: Option<String> = row.try_get("region")?;
        let region = match region_raw.as_deref() {
            None => None,
            Some(raw) => match Region::parse(raw) {
                Some(region) => Some(region),
                None => {
                    tracing::warn!(
                        external_user_id = %external_user_id,
                        region = %raw,
                        "gateway.identity_unknown_region"
                    );
                    return Ok(None);
                }
            },
        };

        let identity = Identity {
            external_user_id: row.try_get("external_user_id")?,
            display_name: row.try_get("display_name")?,
            role,
            region,
        };

        if identity.validate().is_err() {
            tracing::warn!(
                external_user_id = %external_user_id,
                "gateway.identity_invariant_violation"
            );
            return Ok(None);
        }

        Ok(Some(identity))
    }
}
