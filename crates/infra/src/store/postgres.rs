//! Postgres-backed document store.
//!
//! One `documents` table holds every collection:
//!
//! ```sql
//! CREATE TABLE documents (
//!     collection TEXT        NOT NULL,
//!     doc_key    TEXT        NOT NULL,
//!     tenant_id  UUID,
//!     version    BIGINT      NOT NULL,
//!     body       JSONB       NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (collection, doc_key)
//! );
//! ```
//!
//! ## Conditional writes
//!
//! | Expectation | Statement |
//! |-------------|-----------|
//! | `Exact(0)` | `INSERT … ON CONFLICT DO NOTHING` |
//! | `Exact(n)` | `UPDATE … WHERE version = n` |
//! | `Any` | `INSERT … ON CONFLICT DO UPDATE` |
//!
//! A statement that affects no row lost the race and maps to `StoreError::Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use dialtone_core::{ExpectedVersion, TenantId};

use super::r#trait::{DocumentStore, NewDocument, StoreError, StoredDocument};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT        NOT NULL,
    doc_key    TEXT        NOT NULL,
    tenant_id  UUID,
    version    BIGINT      NOT NULL,
    body       JSONB       NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (collection, doc_key)
)
"#;

const TENANT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS documents_collection_tenant ON documents (collection, tenant_id)";

#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    collection: String,
    doc_key: String,
    tenant_id: Option<Uuid>,
    version: i64,
    body: JsonValue,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for StoredDocument {
    fn from(row: DocumentRow) -> Self {
        StoredDocument {
            collection: row.collection,
            key: row.doc_key,
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            version: row.version.max(0) as u64,
            body: row.body,
            updated_at: row.updated_at,
        }
    }
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `documents` table if it does not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        sqlx::query(TENANT_INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn insert_if_absent(&self, doc: &NewDocument) -> Result<Option<DocumentRow>, StoreError> {
        sqlx::query_as::<_, DocumentRow>(
            r#"
            INSERT INTO documents (collection, doc_key, tenant_id, version, body, updated_at)
            VALUES ($1, $2, $3, 1, $4, now())
            ON CONFLICT (collection, doc_key) DO NOTHING
            RETURNING collection, doc_key, tenant_id, version, body, updated_at
            "#,
        )
        .bind(doc.collection)
        .bind(&doc.key)
        .bind(doc.tenant_id.map(Uuid::from))
        .bind(&doc.body)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))
    }

    async fn update_at_version(
        &self,
        doc: &NewDocument,
        version: u64,
    ) -> Result<Option<DocumentRow>, StoreError> {
        sqlx::query_as::<_, DocumentRow>(
            r#"
            UPDATE documents
            SET version = version + 1, body = $4, updated_at = now()
            WHERE collection = $1 AND doc_key = $2
              AND tenant_id IS NOT DISTINCT FROM $3
              AND version = $5
            RETURNING collection, doc_key, tenant_id, version, body, updated_at
            "#,
        )
        .bind(doc.collection)
        .bind(&doc.key)
        .bind(doc.tenant_id.map(Uuid::from))
        .bind(&doc.body)
        .bind(version as i64)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))
    }

    async fn upsert(&self, doc: &NewDocument) -> Result<Option<DocumentRow>, StoreError> {
        sqlx::query_as::<_, DocumentRow>(
            r#"
            INSERT INTO documents (collection, doc_key, tenant_id, version, body, updated_at)
            VALUES ($1, $2, $3, 1, $4, now())
            ON CONFLICT (collection, doc_key) DO UPDATE
              SET version = documents.version + 1, body = EXCLUDED.body, updated_at = now()
              WHERE documents.tenant_id IS NOT DISTINCT FROM EXCLUDED.tenant_id
            RETURNING collection, doc_key, tenant_id, version, body, updated_at
            "#,
        )
        .bind(doc.collection)
        .bind(&doc.key)
        .bind(doc.tenant_id.map(Uuid::from))
        .bind(&doc.body)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))
    }

    /// Explain a lost conditional write.
    async fn rejection(&self, doc: &NewDocument, expected: ExpectedVersion) -> StoreError {
        match self.get(doc.collection, &doc.key).await {
            Ok(Some(current)) if current.tenant_id != doc.tenant_id => StoreError::TenantIsolation(
                format!("{}/{} belongs to another tenant", doc.collection, doc.key),
            ),
            Ok(current) => StoreError::Conflict(format!(
                "{}/{}: expected {expected:?}, found {}",
                doc.collection,
                doc.key,
                current.map(|c| c.version).unwrap_or(0)
            )),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self), err)]
    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT collection, doc_key, tenant_id, version, body, updated_at
            FROM documents
            WHERE collection = $1 AND doc_key = $2
            "#,
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        Ok(row.map(Into::into))
    }

    #[instrument(
        skip(self, document),
        fields(collection = document.collection, key = %document.key, expected_version = ?expected_version),
        err
    )]
    async fn put(
        &self,
        document: NewDocument,
        expected_version: ExpectedVersion,
    ) -> Result<StoredDocument, StoreError> {
        let row = match expected_version {
            ExpectedVersion::Exact(0) => self.insert_if_absent(&document).await?,
            ExpectedVersion::Exact(v) => self.update_at_version(&document, v).await?,
            ExpectedVersion::Any => self.upsert(&document).await?,
        };

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.rejection(&document, expected_version).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT collection, doc_key, tenant_id, version, body, updated_at
            FROM documents
            WHERE collection = $1 AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY doc_key ASC
            "#,
        )
        .bind(collection)
        .bind(tenant_id.map(Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn list_prefix(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
        prefix: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT collection, doc_key, tenant_id, version, body, updated_at
            FROM documents
            WHERE collection = $1
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND starts_with(doc_key, $3)
            ORDER BY doc_key ASC
            "#,
        )
        .bind(collection)
        .bind(tenant_id.map(Uuid::from))
        .bind(prefix)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_prefix", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
