use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use tally_core::error::AppError;
use tally_core::item::{Alias, Item};
use tally_core::traits::{ItemStore, SaveOutcome};
use tally_core::work_queue::QueueSelector;

/// PostgreSQL-backed item store with compare-and-swap writes on `version`.
#[derive(Clone)]
pub struct PgItemStore {
    pool: Pool<Postgres>,
}

impl PgItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, tiid: &str) -> Result<Option<Item>, AppError> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"SELECT tiid, doc, version FROM items WHERE tiid = $1"#,
        )
        .bind(tiid)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(ItemRow::into_item).transpose()
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ItemRow {
    tiid: String,
    doc: serde_json::Value,
    version: i64,
}

impl ItemRow {
    fn into_item(self) -> Result<Item, AppError> {
        let mut item: Item = serde_json::from_value(self.doc)?;
        item.tiid = self.tiid;
        item.version = self.version;
        Ok(item)
    }
}

/// Column values derived from an item for the queue indexes.
struct Projection {
    doc: serde_json::Value,
    needs_aliases: Option<DateTime<Utc>>,
    metrics_runs: serde_json::Value,
}

impl Projection {
    fn of(item: &Item) -> Result<Self, AppError> {
        Ok(Self {
            doc: serde_json::to_value(item)?,
            needs_aliases: item.needs_aliases,
            metrics_runs: serde_json::to_value(&item.metrics_runs)?,
        })
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl ItemStore for PgItemStore {
    async fn get(&self, tiid: &str) -> Result<Option<Item>, AppError> {
        self.fetch(tiid).await
    }

    async fn insert(&self, item: &Item) -> Result<Item, AppError> {
        let mut stored = item.clone();
        stored.version = 1;
        let projection = Projection::of(&stored)?;

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO items (tiid, doc, version, created, last_requested, needs_aliases, metrics_runs)
            VALUES ($1, $2, 1, $3, $4, $5, $6)
            ON CONFLICT (tiid) DO NOTHING
            RETURNING version
            "#,
        )
        .bind(&stored.tiid)
        .bind(&projection.doc)
        .bind(stored.created)
        .bind(stored.last_requested)
        .bind(projection.needs_aliases)
        .bind(&projection.metrics_runs)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match inserted {
            Some(_) => Ok(stored),
            None => Err(AppError::Generic(format!(
                "Item {} already exists",
                stored.tiid
            ))),
        }
    }

    async fn try_save(&self, item: &Item) -> Result<SaveOutcome, AppError> {
        let mut saved = item.clone();
        saved.version = item.version + 1;
        let projection = Projection::of(&saved)?;

        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE items
            SET doc = $2,
                version = version + 1,
                last_requested = $3,
                needs_aliases = $4,
                metrics_runs = $5,
                updated_at = NOW()
            WHERE tiid = $1 AND version = $6
            RETURNING version
            "#,
        )
        .bind(&saved.tiid)
        .bind(&projection.doc)
        .bind(saved.last_requested)
        .bind(projection.needs_aliases)
        .bind(&projection.metrics_runs)
        .bind(item.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some(version) = updated {
            saved.version = version;
            return Ok(SaveOutcome::Saved(saved));
        }

        match self.fetch(&item.tiid).await? {
            Some(current) => Ok(SaveOutcome::Conflict(current)),
            None => Err(AppError::NotFound(item.tiid.clone())),
        }
    }

    async fn view(&self, selector: &QueueSelector, limit_to: usize) -> Result<Vec<String>, AppError> {
        let query = match selector {
            QueueSelector::NeedsAliases => sqlx::query_scalar::<_, String>(
                r#"
                SELECT tiid FROM items
                WHERE needs_aliases IS NOT NULL AND needs_aliases <= $2
                ORDER BY needs_aliases ASC, created ASC, tiid ASC
                LIMIT $1
                "#,
            )
            .bind(limit(limit_to))
            .bind(Utc::now()),
            QueueSelector::NeedsMetrics { provider } => sqlx::query_scalar::<_, String>(
                r#"
                SELECT tiid FROM items
                WHERE needs_aliases IS NULL AND NOT (metrics_runs ? $2)
                ORDER BY last_requested ASC, created ASC, tiid ASC
                LIMIT $1
                "#,
            )
            .bind(limit(limit_to))
            .bind(provider.as_str()),
        };

        query.fetch_all(&self.pool).await.map_err(db_error)
    }

    async fn count(&self, selector: &QueueSelector) -> Result<u64, AppError> {
        let count = match selector {
            QueueSelector::NeedsAliases => {
                sqlx::query_scalar::<_, i64>(
                    r#"SELECT COUNT(*) FROM items WHERE needs_aliases IS NOT NULL"#,
                )
                .fetch_one(&self.pool)
                .await
            }
            QueueSelector::NeedsMetrics { provider } => {
                sqlx::query_scalar::<_, i64>(
                    r#"SELECT COUNT(*) FROM items WHERE needs_aliases IS NULL AND NOT (metrics_runs ? $1)"#,
                )
                .bind(provider.as_str())
                .fetch_one(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn find_by_alias(&self, alias: &Alias) -> Result<Option<String>, AppError> {
        let needle = serde_json::json!({ alias.namespace.as_str(): [alias.id.as_str()] });
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT tiid FROM items
            WHERE doc->'aliases' @> $1
            ORDER BY created ASC, tiid ASC
            LIMIT 1
            "#,
        )
        .bind(&needle)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }
}
