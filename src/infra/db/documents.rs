use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{DocumentsRepo, NewDocumentParams, RepoError},
    domain::entities::DocumentRecord,
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    storage_key: String,
    total_prints: i32,
    created_at: OffsetDateTime,
}

impl From<DocumentRow> for DocumentRecord {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            storage_key: row.storage_key,
            total_prints: row.total_prints,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl DocumentsRepo for PostgresRepositories {
    async fn create_document(
        &self,
        params: NewDocumentParams,
    ) -> Result<DocumentRecord, RepoError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "INSERT INTO documents (storage_key, total_prints) \
             VALUES ($1, $2) \
             RETURNING id, storage_key, total_prints, created_at",
        )
        .bind(&params.storage_key)
        .bind(params.total_prints)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn find_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, RepoError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, storage_key, total_prints, created_at FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Into::into))
    }
}
