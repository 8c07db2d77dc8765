//! Mapping human-supplied document names to stable identifiers.
//!
//! File names are chosen by users and may contain anything, so we never use
//! them for storage layout. Instead, the first time we see a name we allocate
//! a random [`DocumentId`] and record the mapping in a JSON index file.

use std::{collections::BTreeMap, fmt, sync::Arc};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{prelude::*, store::write_json_atomically, sync::MetadataSink};

/// An opaque, stable identifier for a document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Allocate a new random identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Maps document names to [`DocumentId`]s, backed by a JSON index file.
pub struct IdentityResolver {
    /// Where we keep the index.
    index_path: PathBuf,

    /// The in-memory copy of the index. The lock is held for the whole "read
    /// index, mutate, write index" sequence, so two first-time lookups of the
    /// same name can never allocate two identifiers.
    index: Mutex<BTreeMap<String, DocumentId>>,

    /// Where to mirror the index after each change.
    sink: Arc<dyn MetadataSink>,
}

impl IdentityResolver {
    /// Load the index at `index_path`, or start with an empty index if the
    /// file does not exist yet.
    #[instrument(level = "debug", skip_all, fields(path = %index_path.display()))]
    pub async fn open(index_path: PathBuf, sink: Arc<dyn MetadataSink>) -> Result<Self> {
        let index = match tokio::fs::read(&index_path).await {
            Ok(data) => serde_json::from_slice(&data).with_context(|| {
                format!("cannot parse document index {:?}", index_path.display())
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No document index yet, starting empty");
                BTreeMap::new()
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("cannot read document index {:?}", index_path.display())
                });
            }
        };
        Ok(Self {
            index_path,
            index: Mutex::new(index),
            sink,
        })
    }

    /// Get the identifier for `name`, allocating and durably recording a new
    /// one if this is the first time we have seen `name`.
    ///
    /// If the index cannot be written, this fails and the new identifier is
    /// forgotten.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, name: &str) -> Result<DocumentId> {
        let mut index = self.index.lock().await;
        if let Some(id) = index.get(name) {
            return Ok(*id);
        }

        let id = DocumentId::new_random();
        index.insert(name.to_owned(), id);
        if let Err(err) = write_json_atomically(&self.index_path, &*index).await {
            index.remove(name);
            return Err(err.context(format!("cannot record identifier for {name:?}")));
        }
        drop(index);

        info!(%id, "Allocated document identifier");
        self.sink.mirror(&[self.index_path.clone()]).await;
        Ok(id)
    }

    /// Look up `name` without allocating anything.
    pub async fn lookup(&self, name: &str) -> Option<DocumentId> {
        self.index.lock().await.get(name).copied()
    }

    /// All known document names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.index.lock().await.keys().cloned().collect()
    }

    /// Remove the mapping for `name`, returning the old identifier.
    #[instrument(level = "debug", skip(self))]
    pub async fn forget(&self, name: &str) -> Result<Option<DocumentId>> {
        let mut index = self.index.lock().await;
        let Some(id) = index.remove(name) else {
            return Ok(None);
        };
        if let Err(err) = write_json_atomically(&self.index_path, &*index).await {
            index.insert(name.to_owned(), id);
            return Err(err.context(format!("cannot remove identifier for {name:?}")));
        }
        drop(index);

        self.sink.mirror(&[self.index_path.clone()]).await;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::sync::NoopSink;

    use super::*;

    async fn resolver_in(dir: &Path) -> IdentityResolver {
        IdentityResolver::open(dir.join("index.json"), Arc::new(NoopSink))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolve_is_stable_and_distinct() {
        let dir = tempfile::TempDir::with_prefix("identity").unwrap();
        let resolver = resolver_in(dir.path()).await;

        let a = resolver.resolve("a.pdf").await.unwrap();
        let b = resolver.resolve("b.pdf").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(resolver.resolve("a.pdf").await.unwrap(), a);
        assert_eq!(resolver.lookup("b.pdf").await, Some(b));
        assert_eq!(resolver.names().await, vec!["a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn mappings_survive_reopening() {
        let dir = tempfile::TempDir::with_prefix("identity").unwrap();
        let id = resolver_in(dir.path())
            .await
            .resolve("report.pdf")
            .await
            .unwrap();
        let reopened = resolver_in(dir.path()).await;
        assert_eq!(reopened.lookup("report.pdf").await, Some(id));
    }

    #[tokio::test]
    async fn failed_writes_do_not_allocate() {
        let dir = tempfile::TempDir::with_prefix("identity").unwrap();
        let resolver = IdentityResolver::open(
            dir.path().join("no-such-dir").join("index.json"),
            Arc::new(NoopSink),
        )
        .await
        .unwrap();
        assert!(resolver.resolve("report.pdf").await.is_err());
        assert_eq!(resolver.lookup("report.pdf").await, None);
    }

    #[tokio::test]
    async fn concurrent_first_lookups_agree() {
        let dir = tempfile::TempDir::with_prefix("identity").unwrap();
        let resolver = Arc::new(resolver_in(dir.path()).await);
        let mut handles = vec![];
        for _ in 0..16 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve("same.pdf").await.unwrap()
            }));
        }
        let mut ids = BTreeSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn forget_removes_mapping() {
        let dir = tempfile::TempDir::with_prefix("identity").unwrap();
        let resolver = resolver_in(dir.path()).await;
        let id = resolver.resolve("gone.pdf").await.unwrap();
        assert_eq!(resolver.forget("gone.pdf").await.unwrap(), Some(id));
        assert_eq!(resolver.forget("gone.pdf").await.unwrap(), None);
        assert_eq!(resolver_in(dir.path()).await.lookup("gone.pdf").await, None);
    }
}
