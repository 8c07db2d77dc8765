//! One JSON file per page.
//!
//! Layout: `<root>/<document id>/<page>.json`. A document is "in" the store
//! if its directory exists.

use std::{io, sync::Arc};

use crate::{identity::DocumentId, prelude::*, sync::MetadataSink};

use super::{PageResult, PageStore, write_json_atomically};

/// A [`PageStore`] which keeps each page in its own JSON file.
pub struct JsonPageStore {
    /// The directory which holds one subdirectory per document.
    root: PathBuf,

    /// Where to mirror files after each write.
    sink: Arc<dyn MetadataSink>,
}

impl JsonPageStore {
    /// Create a new store rooted at `root`, creating it if needed.
    pub async fn open(root: PathBuf, sink: Arc<dyn MetadataSink>) -> Result<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("cannot create page store {:?}", root.display()))?;
        Ok(Self { root, sink })
    }

    fn document_dir(&self, id: &DocumentId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn page_path(&self, id: &DocumentId, page: u32) -> PathBuf {
        self.document_dir(id).join(format!("{page}.json"))
    }
}

#[async_trait]
impl PageStore for JsonPageStore {
    async fn get(&self, id: &DocumentId, page: u32) -> Result<Option<PageResult>> {
        let path = self.page_path(id, page);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let result = serde_json::from_slice(&data)
                    .with_context(|| format!("cannot parse {:?}", path.display()))?;
                Ok(Some(result))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("cannot read {:?}", path.display()))
            }
        }
    }

    #[instrument(level = "debug", skip(self, result), fields(status = %result.status))]
    async fn put(&self, id: &DocumentId, page: u32, result: &PageResult) -> Result<()> {
        let dir = self.document_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {:?}", dir.display()))?;
        let path = self.page_path(id, page);
        write_json_atomically(&path, result).await?;
        self.sink.mirror(&[path]).await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, id: &DocumentId) -> Result<()> {
        let dir = self.document_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                self.sink.mirror(&[dir]).await;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("cannot delete {:?}", dir.display()))
            }
        }
    }

    async fn pages(&self, id: &DocumentId) -> Result<Vec<u32>> {
        let dir = self.document_dir(id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(err).with_context(|| format!("cannot list {:?}", dir.display()));
            }
        };
        let mut pages = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("cannot list {:?}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(page) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok())
                {
                    pages.push(page);
                }
            }
        }
        pages.sort_unstable();
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use crate::{store::PageStatus, sync::NoopSink};

    use super::*;

    async fn store_in(dir: &Path) -> JsonPageStore {
        JsonPageStore::open(dir.join("pages"), Arc::new(NoopSink))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_returns_written_value() {
        let dir = tempfile::TempDir::with_prefix("json-store").unwrap();
        let store = store_in(dir.path()).await;
        let id = DocumentId::new_random();

        assert_eq!(store.get(&id, 1).await.unwrap(), None);
        let first = PageResult::new("first", PageStatus::Extracted);
        store.put(&id, 1, &first).await.unwrap();
        assert_eq!(store.get(&id, 1).await.unwrap(), Some(first));

        let edited = PageResult::new("edited", PageStatus::Edited);
        store.put(&id, 1, &edited).await.unwrap();
        assert_eq!(store.get(&id, 1).await.unwrap(), Some(edited));
    }

    #[tokio::test]
    async fn files_use_documented_layout() {
        let dir = tempfile::TempDir::with_prefix("json-store").unwrap();
        let store = store_in(dir.path()).await;
        let id = DocumentId::new_random();
        store
            .put(&id, 7, &PageResult::new("seven", PageStatus::Extracted))
            .await
            .unwrap();
        let path = dir.path().join("pages").join(id.to_string()).join("7.json");
        let value: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(value["text"], "seven");
    }

    #[tokio::test]
    async fn delete_removes_every_page() {
        let dir = tempfile::TempDir::with_prefix("json-store").unwrap();
        let store = store_in(dir.path()).await;
        let id = DocumentId::new_random();
        let other = DocumentId::new_random();
        for page in [1, 2, 10] {
            store
                .put(&id, page, &PageResult::new("x", PageStatus::Extracted))
                .await
                .unwrap();
        }
        store
            .put(&other, 1, &PageResult::new("keep", PageStatus::Extracted))
            .await
            .unwrap();
        assert_eq!(store.pages(&id).await.unwrap(), vec![1, 2, 10]);

        store.delete(&id).await.unwrap();
        for page in [1, 2, 10] {
            assert_eq!(store.get(&id, page).await.unwrap(), None);
        }
        assert!(store.pages(&id).await.unwrap().is_empty());
        assert!(store.get(&other, 1).await.unwrap().is_some());

        // Deleting twice is fine.
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_puts_to_different_pages() {
        let dir = tempfile::TempDir::with_prefix("json-store").unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let id = DocumentId::new_random();
        let mut handles = vec![];
        for page in 1..=20u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let result = PageResult::new(format!("page {page}"), PageStatus::Extracted);
                store.put(&id, page, &result).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for page in 1..=20u32 {
            let result = store.get(&id, page).await.unwrap().unwrap();
            assert_eq!(result.text, format!("page {page}"));
        }
    }
}
