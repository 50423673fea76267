use std::{fs, path::Path};

use serde::Serialize;
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteRow},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const CURSOR_KEY: &str = "sync.delta_link";

// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const BIND_CHUNK: usize = 500;

const ITEM_COLUMNS: &str =
    "id, name, parent_id, path, content_hash, size, created_at, modified_at, is_folder, web_url";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemRecord {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub path: Option<String>,
    pub content_hash: Option<String>,
    pub size: Option<i64>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_folder: bool,
    pub web_url: Option<String>,
}

// Enrichment columns; sync upserts never touch them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedFields {
    pub photo_taken_at: Option<i64>,
    pub camera_model: Option<String>,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub content_hash: String,
    pub items: Vec<ItemRecord>,
    pub size_mismatch: bool,
}

impl DuplicateGroup {
    pub fn representative_size(&self) -> u64 {
        self.items
            .iter()
            .filter_map(|item| item.size)
            .min()
            .map(|size| size.max(0) as u64)
            .unwrap_or(0)
    }

    pub fn wasted_bytes(&self) -> u64 {
        let extra = self.items.len().saturating_sub(1) as u64;
        extra.saturating_mul(self.representative_size())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateStats {
    pub group_count: u64,
    pub wasted_bytes: u64,
    pub mismatched_groups: u64,
}

// Each operation holds the lock for its whole duration. Once closed, reads
// return empty results and writes are dropped.
pub struct MirrorStore {
    pool: Mutex<Option<SqlitePool>>,
}

impl MirrorStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool: Mutex::new(Some(pool)),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        let guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            MIGRATOR.run(pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("mirror store closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.pool.lock().await.is_none()
    }

    pub async fn upsert_many(&self, records: &[ItemRecord]) -> Result<usize, IndexError> {
        if records.is_empty() {
            return Ok(0);
        }
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(0);
        };

        let mut tx = pool.begin().await?;
        for record in records {
            let content_hash = if record.is_folder {
                None
            } else {
                record.content_hash.as_deref()
            };
            sqlx::query(
                "INSERT INTO items (
                    id, name, parent_id, path, content_hash, size,
                    created_at, modified_at, is_folder, web_url
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    parent_id = excluded.parent_id,
                    path = excluded.path,
                    content_hash = excluded.content_hash,
                    size = excluded.size,
                    created_at = excluded.created_at,
                    modified_at = excluded.modified_at,
                    is_folder = excluded.is_folder,
                    web_url = excluded.web_url",
            )
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.parent_id)
            .bind(&record.path)
            .bind(content_hash)
            .bind(record.size)
            .bind(record.created_at)
            .bind(record.modified_at)
            .bind(if record.is_folder { 1 } else { 0 })
            .bind(&record.web_url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    pub async fn delete_many(&self, ids: &[String]) -> Result<u64, IndexError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(0);
        };

        let mut tx = pool.begin().await?;
        let mut removed = 0;
        for chunk in ids.chunks(BIND_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM items WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");
            removed += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    // Aggregate first, then fetch only the rows carrying a shared hash.
    pub async fn get_duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let hashes: Vec<String> = sqlx::query(
            "SELECT content_hash
             FROM items
             WHERE is_folder = 0 AND content_hash IS NOT NULL
             GROUP BY content_hash
             HAVING COUNT(*) > 1
             ORDER BY content_hash ASC",
        )
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.try_get::<String, _>("content_hash"))
        .collect::<Result<_, _>>()?;

        let mut groups: Vec<DuplicateGroup> = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(BIND_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE is_folder = 0 AND content_hash IN ("
            ));
            let mut separated = builder.separated(", ");
            for hash in chunk {
                separated.push_bind(hash.as_str());
            }
            separated.push_unseparated(") ORDER BY content_hash ASC, id ASC");

            for row in builder.build().fetch_all(pool).await? {
                let item = item_from_row(&row)?;
                let hash = item.content_hash.clone().unwrap_or_default();
                match groups.last_mut() {
                    Some(group) if group.content_hash == hash => group.items.push(item),
                    _ => groups.push(DuplicateGroup {
                        content_hash: hash,
                        items: vec![item],
                        size_mismatch: false,
                    }),
                }
            }
        }

        let mut mismatched = 0u64;
        for group in &mut groups {
            let sizes = group.items.iter().filter_map(|item| item.size);
            group.size_mismatch = sizes_mismatch(
                group.items.len(),
                sizes.clone().count(),
                sizes.clone().min(),
                sizes.max(),
            );
            if group.size_mismatch {
                mismatched += 1;
            }
        }
        warn_mismatched(mismatched);
        Ok(groups)
    }

    pub async fn get_stats(&self) -> Result<DuplicateStats, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(DuplicateStats::default());
        };

        let rows = sqlx::query(
            "SELECT COUNT(*) AS members,
                    COUNT(size) AS sized,
                    MIN(size) AS min_size,
                    MAX(size) AS max_size
             FROM items
             WHERE is_folder = 0 AND content_hash IS NOT NULL
             GROUP BY content_hash
             HAVING COUNT(*) > 1",
        )
        .fetch_all(pool)
        .await?;

        let mut stats = DuplicateStats::default();
        for row in rows {
            let members: i64 = row.try_get("members")?;
            let sized: i64 = row.try_get("sized")?;
            let min_size: Option<i64> = row.try_get("min_size")?;
            let max_size: Option<i64> = row.try_get("max_size")?;

            stats.group_count += 1;
            if sizes_mismatch(
                members.max(0) as usize,
                sized.max(0) as usize,
                min_size,
                max_size,
            ) {
                stats.mismatched_groups += 1;
            }
            let representative = min_size.unwrap_or(0).max(0) as u64;
            let extra = (members - 1).max(0) as u64;
            stats.wasted_bytes = stats
                .wasted_bytes
                .saturating_add(extra.saturating_mul(representative));
        }
        warn_mismatched(stats.mismatched_groups);
        Ok(stats)
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(None);
        };
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(item_from_row).transpose()?)
    }

    pub async fn get_all_items(&self) -> Result<Vec<ItemRecord>, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY id ASC"))
            .fetch_all(pool)
            .await?;
        Ok(rows.iter().map(item_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<ItemRecord>, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE parent_id = ?1 ORDER BY name ASC, id ASC"
        ))
        .bind(parent_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(item_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn get_item_count(&self) -> Result<u64, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(0);
        };
        let count: i64 = sqlx::query("SELECT COUNT(*) AS total FROM items")
            .fetch_one(pool)
            .await?
            .try_get("total")?;
        Ok(count.max(0) as u64)
    }

    pub async fn get_total_size(&self) -> Result<u64, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(0);
        };
        let total: i64 =
            sqlx::query("SELECT COALESCE(SUM(size), 0) AS total FROM items WHERE is_folder = 0")
                .fetch_one(pool)
                .await?
                .try_get("total")?;
        Ok(total.max(0) as u64)
    }

    // Also drops the cursor; other settings survive.
    pub async fn clear_all(&self) -> Result<(), IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM items").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM config WHERE key = ?1")
            .bind(CURSOR_KEY)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_extended(
        &self,
        id: &str,
        fields: &ExtendedFields,
    ) -> Result<bool, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(false);
        };
        let result = sqlx::query(
            "UPDATE items SET photo_taken_at = ?1, camera_model = ?2, transcript = ?3 WHERE id = ?4",
        )
        .bind(fields.photo_taken_at)
        .bind(&fields.camera_model)
        .bind(&fields.transcript)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_extended(&self, id: &str) -> Result<Option<ExtendedFields>, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT photo_taken_at, camera_model, transcript FROM items WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ExtendedFields {
            photo_taken_at: row.try_get("photo_taken_at")?,
            camera_model: row.try_get("camera_model")?,
            transcript: row.try_get("transcript")?,
        }))
    }

    pub async fn get_cursor(&self) -> Result<Option<String>, IndexError> {
        self.get_setting(CURSOR_KEY).await
    }

    pub async fn set_cursor(&self, cursor: &str) -> Result<(), IndexError> {
        self.set_setting(CURSOR_KEY, cursor).await
    }

    pub async fn clear_cursor(&self) -> Result<(), IndexError> {
        self.delete_setting(CURSOR_KEY).await
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<String, _>("value"))
            .transpose()?)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<(), IndexError> {
        let guard = self.pool.lock().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        sqlx::query("DELETE FROM config WHERE key = ?1")
            .bind(key)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// A group is mismatched when any member lacks a size or sizes differ.
fn sizes_mismatch(members: usize, sized: usize, min: Option<i64>, max: Option<i64>) -> bool {
    sized != members || min != max
}

fn warn_mismatched(count: u64) {
    if count > 0 {
        warn!(
            mismatched = count,
            "duplicate groups with differing member sizes; counting the smallest size"
        );
    }
}

fn item_from_row(row: &SqliteRow) -> Result<ItemRecord, sqlx::Error> {
    let is_folder: i64 = row.try_get("is_folder")?;
    Ok(ItemRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        path: row.try_get("path")?,
        content_hash: row.try_get("content_hash")?,
        size: row.try_get("size")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        is_folder: is_folder != 0,
        web_url: row.try_get("web_url")?,
    })
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
