//! Page results in a single SQLite table.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{
    async_utils::spawn_blocking_propagating_panics, identity::DocumentId, prelude::*,
};

use super::{PageResult, PageStatus, PageStore};

/// Our schema. The unique constraint is what makes `put` an upsert.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS page_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    text TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'extracted',
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(document_id, page_number)
);
"#;

/// A [`PageStore`] backed by SQLite.
///
/// `rusqlite` is synchronous, so every call runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqlitePageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePageStore {
    /// Open (or create) the database at `path`.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: PathBuf) -> Result<Self> {
        spawn_blocking_propagating_panics(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("cannot open database {:?}", path.display()))?;
            Self::from_connection(conn)
        })
        .await
    }

    /// Use an in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("cannot create page_results table")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with our connection on the blocking thread pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking_propagating_panics(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("SQLite connection lock was poisoned"))?;
            f(&conn)
        })
        .await
    }
}

#[async_trait]
impl PageStore for SqlitePageStore {
    async fn get(&self, id: &DocumentId, page: u32) -> Result<Option<PageResult>> {
        let id = id.to_string();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT text, status FROM page_results
                     WHERE document_id = ?1 AND page_number = ?2",
                    params![id, page],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .context("cannot query page_results")
            })
            .await?;
        row.map(|(text, status)| -> Result<PageResult> {
            Ok(PageResult::new(text, status.parse::<PageStatus>()?))
        })
        .transpose()
    }

    #[instrument(level = "debug", skip(self, result), fields(status = %result.status))]
    async fn put(&self, id: &DocumentId, page: u32, result: &PageResult) -> Result<()> {
        let id = id.to_string();
        let text = result.text.clone();
        let status = result.status.as_str();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO page_results (document_id, page_number, text, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(document_id, page_number) DO UPDATE SET
                     text = excluded.text,
                     status = excluded.status,
                     updated_at = CURRENT_TIMESTAMP",
                params![id, page, text, status],
            )
            .context("cannot upsert into page_results")?;
            Ok(())
        })
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, id: &DocumentId) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM page_results WHERE document_id = ?1",
                params![id],
            )
            .context("cannot delete from page_results")?;
            Ok(())
        })
        .await
    }

    async fn pages(&self, id: &DocumentId) -> Result<Vec<u32>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT page_number FROM page_results
                 WHERE document_id = ?1 ORDER BY page_number",
            )?;
            let pages = stmt
                .query_map(params![id], |row| row.get::<_, u32>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("cannot list pages")?;
            Ok(pages)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_whole_row() {
        let store = SqlitePageStore::open_in_memory().unwrap();
        let id = DocumentId::new_random();
        store
            .put(&id, 2, &PageResult::new("ocr", PageStatus::Extracted))
            .await
            .unwrap();
        store
            .put(&id, 2, &PageResult::new("fixed", PageStatus::Edited))
            .await
            .unwrap();
        assert_eq!(
            store.get(&id, 2).await.unwrap(),
            Some(PageResult::new("fixed", PageStatus::Edited))
        );
        assert_eq!(store.pages(&id).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn delete_is_scoped_to_one_document() {
        let store = SqlitePageStore::open_in_memory().unwrap();
        let (a, b) = (DocumentId::new_random(), DocumentId::new_random());
        for page in 1..=3 {
            store
                .put(&a, page, &PageResult::new("a", PageStatus::Extracted))
                .await
                .unwrap();
        }
        store
            .put(&b, 1, &PageResult::new("b", PageStatus::Refined))
            .await
            .unwrap();

        store.delete(&a).await.unwrap();
        for page in 1..=3 {
            assert_eq!(store.get(&a, page).await.unwrap(), None);
        }
        assert_eq!(
            store.get(&b, 1).await.unwrap(),
            Some(PageResult::new("b", PageStatus::Refined))
        );
    }

    #[tokio::test]
    async fn data_survives_reopening() {
        let dir = tempfile::TempDir::with_prefix("sqlite-store").unwrap();
        let path = dir.path().join("ocr_data.db");
        let id = DocumentId::new_random();
        SqlitePageStore::open(path.clone())
            .await
            .unwrap()
            .put(&id, 1, &PageResult::new("kept", PageStatus::Extracted))
            .await
            .unwrap();
        let reopened = SqlitePageStore::open(path).await.unwrap();
        assert_eq!(reopened.get(&id, 1).await.unwrap().unwrap().text, "kept");
    }
}
