use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{AccessGrantsRepo, RepoError, UpsertAccessGrantParams},
    domain::entities::AccessGrantRecord,
};

use super::{PostgresRepositories, map_sqlx_error};

const GRANT_COLUMNS: &str =
    "id, user_id, document_id, session_token, prints_allowed, prints_used, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct AccessGrantRow {
    id: Uuid,
    user_id: String,
    document_id: Uuid,
    session_token: String,
    prints_allowed: i32,
    prints_used: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<AccessGrantRow> for AccessGrantRecord {
    fn from(row: AccessGrantRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            document_id: row.document_id,
            session_token: row.session_token,
            prints_allowed: row.prints_allowed,
            prints_used: row.prints_used,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl AccessGrantsRepo for PostgresRepositories {
    async fn upsert_access_grant(
        &self,
        params: UpsertAccessGrantParams,
    ) -> Result<AccessGrantRecord, RepoError> {
        let row = sqlx::query_as::<_, AccessGrantRow>(&format!(
            "INSERT INTO access_grants (user_id, document_id, session_token, prints_allowed) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, document_id) DO UPDATE \
                SET session_token = EXCLUDED.session_token, \
                    prints_allowed = EXCLUDED.prints_allowed, \
                    updated_at = now() \
             RETURNING {GRANT_COLUMNS}"
        ))
        .bind(&params.user_id)
        .bind(params.document_id)
        .bind(&params.session_token)
        .bind(params.prints_allowed)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn find_access_grant(
        &self,
        user_id: &str,
        document_id: Uuid,
    ) -> Result<Option<AccessGrantRecord>, RepoError> {
        let row = sqlx::query_as::<_, AccessGrantRow>(&format!(
            "SELECT {GRANT_COLUMNS} FROM access_grants \
              WHERE user_id = $1 AND document_id = $2"
        ))
        .bind(user_id)
        .bind(document_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Into::into))
    }
}
