//! Durable storage for per-page text.
//!
//! A [`PageStore`] maps `(document, page)` to a [`PageResult`]. Writes are
//! full replacements, and a `put` must be durable before it returns, so a
//! following `get` always sees it.

use std::{fmt, io::Write as _, str::FromStr};

use clap::ValueEnum;

use crate::{
    async_utils::spawn_blocking_propagating_panics, identity::DocumentId, prelude::*,
};

pub mod json;
pub mod sqlite;

pub use self::{json::JsonPageStore, sqlite::SqlitePageStore};

/// How did a stored page's text come to be?
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Extracted from the text layer or by OCR, then normalized.
    #[default]
    Extracted,
    /// Replaced by a person.
    Edited,
    /// Cleaned up by the refinement service.
    Refined,
}

impl PageStatus {
    /// The name we use in storage and output.
    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::Extracted => "extracted",
            PageStatus::Edited => "edited",
            PageStatus::Refined => "refined",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extracted" => Ok(PageStatus::Extracted),
            "edited" => Ok(PageStatus::Edited),
            "refined" => Ok(PageStatus::Refined),
            _ => Err(anyhow!("unknown page status {:?}", s)),
        }
    }
}

/// The stored text of one page.
///
/// On disk this is `{ "text": "...", "status": "extracted" }`. Files which
/// only contain `text` are read as [`PageStatus::Extracted`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// The page text.
    pub text: String,

    /// Where the text came from.
    #[serde(default)]
    pub status: PageStatus,
}

impl PageResult {
    /// Create a new page result.
    pub fn new(text: impl Into<String>, status: PageStatus) -> Self {
        Self {
            text: text.into(),
            status,
        }
    }
}

/// Storage backend for page results.
///
/// Implementations must give read-after-write consistency for a key, and
/// concurrent writes to different keys must not interfere.
#[async_trait]
pub trait PageStore: Send + Sync + 'static {
    /// Look up a page. Never triggers extraction.
    async fn get(&self, id: &DocumentId, page: u32) -> Result<Option<PageResult>>;

    /// Replace the stored result for a page.
    async fn put(&self, id: &DocumentId, page: u32, result: &PageResult) -> Result<()>;

    /// Remove every page of a document.
    async fn delete(&self, id: &DocumentId) -> Result<()>;

    /// Which pages of a document have stored results, in ascending order?
    async fn pages(&self, id: &DocumentId) -> Result<Vec<u32>>;
}

/// Supported storage backends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum StoreBackend {
    /// One JSON file per page, one directory per document.
    #[default]
    Json,
    /// A single SQLite table.
    Sqlite,
}

/// Serialize `value` as JSON and write it to `path`, replacing any existing
/// file in a single rename.
pub async fn write_json_atomically<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("cannot serialize {:?}", path.display()))?;
    write_atomically(path, data).await
}

/// Write `data` to `path`, replacing any existing file in a single rename.
///
/// The temporary file is created next to `path`, so the rename never crosses
/// file systems.
pub async fn write_atomically(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("no parent directory for {:?}", path.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot create temporary file in {:?}", dir.display()))?;
        tmp.write_all(&data)
            .with_context(|| format!("cannot write temporary file for {:?}", path.display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("cannot sync temporary file for {:?}", path.display()))?;
        tmp.persist(&path)
            .with_context(|| format!("cannot replace {:?}", path.display()))?;
        Ok(())
    })
    .await
}
