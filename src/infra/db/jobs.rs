use std::convert::TryFrom;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{JobsRepo, NewJobParams, RepoError},
    domain::{
        entities::{JobRecord, PageArtifact},
        layout::PageLayout,
        types::{JobStage, JobStatus},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

const JOB_COLUMNS: &str = "id, user_id, email, assigned_quota, total_pages, completed_pages, \
     page_artifacts, layout_pages, stage, status, output_document_id, failure_reason, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    user_id: String,
    email: Option<String>,
    assigned_quota: Option<f64>,
    total_pages: i32,
    completed_pages: i32,
    page_artifacts: serde_json::Value,
    layout_pages: serde_json::Value,
    stage: String,
    status: String,
    output_document_id: Option<Uuid>,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let stage = JobStage::try_from(row.stage.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown job stage `{}`", row.stage))
        })?;
        let status = JobStatus::try_from(row.status.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown job status `{}`", row.status))
        })?;
        let page_artifacts: Vec<PageArtifact> = serde_json::from_value(row.page_artifacts)
            .map_err(RepoError::from_persistence)?;
        let layout_pages: Vec<PageLayout> =
            serde_json::from_value(row.layout_pages).map_err(RepoError::from_persistence)?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            email: row.email,
            assigned_quota: row.assigned_quota,
            total_pages: row.total_pages,
            completed_pages: row.completed_pages,
            page_artifacts,
            layout_pages,
            stage,
            status,
            output_document_id: row.output_document_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl JobsRepo for PostgresRepositories {
    async fn create_job(&self, params: NewJobParams) -> Result<JobRecord, RepoError> {
        let layout_pages =
            serde_json::to_value(&params.layout_pages).map_err(RepoError::from_persistence)?;
        let total_pages = params.layout_pages.len() as i32;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "INSERT INTO print_jobs (user_id, email, assigned_quota, total_pages, layout_pages) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&params.user_id)
        .bind(&params.email)
        .bind(params.assigned_quota)
        .bind(total_pages)
        .bind(layout_pages)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        JobRecord::try_from(row)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM print_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn record_page_artifact(
        &self,
        job_id: Uuid,
        artifact: PageArtifact,
    ) -> Result<JobRecord, RepoError> {
        let artifact_json =
            serde_json::to_value(&artifact).map_err(RepoError::from_persistence)?;

        // One statement: appending the artifact, bumping the counter and
        // entering the rendering stage share a single linearization point.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE print_jobs \
                SET page_artifacts = page_artifacts || jsonb_build_array($2::jsonb), \
                    completed_pages = completed_pages + 1, \
                    stage = 'rendering', \
                    status = 'processing', \
                    updated_at = now() \
              WHERE id = $1 \
              RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(artifact_json)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        JobRecord::try_from(row)
    }

    async fn claim_merge_trigger(&self, job_id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE print_jobs \
                SET stage = 'merging', updated_at = now() \
              WHERE id = $1 \
                AND output_document_id IS NULL \
                AND stage IN ('pending', 'rendering')",
        )
        .bind(job_id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_merge_run(&self, job_id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE print_jobs \
                SET stage = 'merging', status = 'processing', updated_at = now() \
              WHERE id = $1 \
                AND output_document_id IS NULL \
                AND stage <> 'completed'",
        )
        .bind(job_id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn finalize_job(&self, job_id: Uuid, document_id: Uuid) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE print_jobs \
                SET stage = 'completed', \
                    status = 'completed', \
                    output_document_id = $2, \
                    failure_reason = NULL, \
                    updated_at = now() \
              WHERE id = $1",
        )
        .bind(job_id)
        .bind(document_id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE print_jobs \
                SET stage = 'failed', status = 'failed', failure_reason = $2, \
                    updated_at = now() \
              WHERE id = $1",
        )
        .bind(job_id)
        .bind(reason)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn reset_job_stage(
        &self,
        job_id: Uuid,
        stage: JobStage,
        status: JobStatus,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE print_jobs \
                SET stage = $2, status = $3, failure_reason = NULL, updated_at = now() \
              WHERE id = $1",
        )
        .bind(job_id)
        .bind(stage.as_str())
        .bind(status.as_str())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn dedupe_page_artifacts(&self, job_id: Uuid) -> Result<JobRecord, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM print_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let job = JobRecord::try_from(row)?;

        let mut seen = std::collections::BTreeSet::new();
        let mut artifacts = job.page_artifacts.clone();
        artifacts.retain(|artifact| seen.insert(artifact.page_index));

        let artifacts_json =
            serde_json::to_value(&artifacts).map_err(RepoError::from_persistence)?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE print_jobs \
                SET page_artifacts = $2, completed_pages = $3, updated_at = now() \
              WHERE id = $1 \
              RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(artifacts_json)
        .bind(artifacts.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        JobRecord::try_from(row)
    }
}
