use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use super::document::{values_at, Document, Filter};
use super::{unique_indexes_for, Collection, DocumentStore, Mutation, UpdateOutcome};
use crate::errors::{AuthzError, AuthzResult};

/// Postgres-backed document store. Every collection shares one JSONB table; unique indexes are
/// materialized into `unique_values` inside the same transaction as the document write.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending schema migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Replaces the unique-index rows owned by `id` with the values `doc` holds now.
    async fn write_unique(
        tx: &mut Transaction<'_, Postgres>,
        collection: Collection,
        id: &str,
        doc: &Document,
    ) -> AuthzResult<()> {
        for index in unique_indexes_for(collection) {
            sqlx::query(
                "DELETE FROM unique_values WHERE collection = $1 AND index_name = $2 AND doc_id = $3",
            )
            .bind(collection.name())
            .bind(index.name)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;

            let values: BTreeSet<String> = values_at(doc, index.path)
                .into_iter()
                .map(Value::to_string)
                .collect();
            for value in values {
                sqlx::query(
                    "INSERT INTO unique_values (collection, index_name, value, doc_id) VALUES ($1, $2, $3, $4)",
                )
                .bind(collection.name())
                .bind(index.name)
                .bind(&value)
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(|e| match store_err(e) {
                    AuthzError::InvariantViolation(_) => AuthzError::InvariantViolation(format!(
                        "unique index {} violated: {} already held",
                        index.name, value
                    )),
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    async fn clear_unique(
        tx: &mut Transaction<'_, Postgres>,
        collection: Collection,
        id: &str,
    ) -> AuthzResult<()> {
        sqlx::query("DELETE FROM unique_values WHERE collection = $1 AND doc_id = $2")
            .bind(collection.name())
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// Unique-constraint failures are data-integrity errors; everything else is plumbing.
fn store_err(e: sqlx::Error) -> AuthzError {
    let unique = match &e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    };
    if unique {
        AuthzError::InvariantViolation(e.to_string())
    } else {
        AuthzError::Store(e.into())
    }
}

fn with_id(mut doc: Document, id: &str) -> Document {
    if let Some(map) = doc.as_object_mut() {
        map.insert("_id".to_string(), Value::String(id.to_string()));
    }
    doc
}

/// SQL/JSONPath rendering of a dotted path. Lax mode unwraps arrays on member access, which
/// matches the fan-out of [`values_at`].
fn json_path(path: &str) -> String {
    let mut out = String::from("$");
    for seg in path.split('.') {
        out.push_str(".\"");
        out.push_str(&seg.replace('\\', "\\\\").replace('"', "\\\""));
        out.push('"');
    }
    out
}

/// A condition Postgres can evaluate to narrow the scan: `(jsonpath, vars)`. Only scalar
/// equality and existence are pushed down; the full filter is re-applied in memory.
fn pushdown(filter: &Filter) -> Option<(String, Value)> {
    match filter {
        Filter::Eq(path, v) if !v.is_object() && !v.is_array() && !v.is_null() => Some((
            format!("{} ? (@ == $v)", json_path(path)),
            serde_json::json!({ "v": v }),
        )),
        Filter::Exists(path) => Some((json_path(path), serde_json::json!({}))),
        Filter::And(all) => all.iter().find_map(pushdown),
        _ => None,
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, collection: Collection, id: &str) -> AuthzResult<Option<Document>> {
        sqlx::query_scalar::<_, Value>("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection.name())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn insert(&self, collection: Collection, id: &str, doc: Document) -> AuthzResult<bool> {
        let doc = with_id(doc, id);
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let inserted = sqlx::query(
            "INSERT INTO documents (collection, id, doc) VALUES ($1, $2, $3) ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(collection.name())
        .bind(id)
        .bind(&doc)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected()
            > 0;
        if !inserted {
            return Ok(false);
        }
        Self::write_unique(&mut tx, collection, id, &doc).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn put(&self, collection: Collection, id: &str, doc: Document) -> AuthzResult<()> {
        let doc = with_id(doc, id);
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            r#"INSERT INTO documents (collection, id, doc) VALUES ($1, $2, $3)
               ON CONFLICT (collection, id) DO UPDATE SET doc = EXCLUDED.doc"#,
        )
        .bind(collection.name())
        .bind(id)
        .bind(&doc)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        Self::write_unique(&mut tx, collection, id, &doc).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        mutate: &Mutation<'_>,
    ) -> AuthzResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let existing = sqlx::query_scalar::<_, Value>(
            "SELECT doc FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(collection.name())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let Some(mut doc) = existing else {
            return Ok(UpdateOutcome::Missing);
        };
        if !mutate(&mut doc)? {
            return Ok(UpdateOutcome::Unchanged);
        }
        let doc = with_id(doc, id);
        sqlx::query("UPDATE documents SET doc = $3 WHERE collection = $1 AND id = $2")
            .bind(collection.name())
            .bind(id)
            .bind(&doc)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        Self::write_unique(&mut tx, collection, id, &doc).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(UpdateOutcome::Updated)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AuthzResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let removed = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection.name())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected()
            > 0;
        Self::clear_unique(&mut tx, collection, id).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(removed)
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> AuthzResult<Vec<Document>> {
        let rows = match pushdown(filter) {
            Some((path, vars)) => sqlx::query_scalar::<_, Value>(
                r#"SELECT doc FROM documents
                   WHERE collection = $1 AND jsonb_path_exists(doc, $2::jsonpath, $3)
                   ORDER BY id"#,
            )
            .bind(collection.name())
            .bind(path)
            .bind(vars)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query_scalar::<_, Value>(
                "SELECT doc FROM documents WHERE collection = $1 ORDER BY id",
            )
            .bind(collection.name())
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(store_err)?;

        Ok(rows.into_iter().filter(|d| filter.matches(d)).collect())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> AuthzResult<usize> {
        if *filter == Filter::All {
            let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM documents WHERE collection = $1")
                .bind(collection.name())
                .fetch_one(&self.pool)
                .await
                .map_err(store_err)?;
            return Ok(n.max(0) as usize);
        }
        Ok(self.find(collection, filter).await?.len())
    }
}

// ── Tests ──────────────────────────────────────────────────────
