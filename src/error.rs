//! Errors which callers need to tell apart.
//!
//! Most of this program uses [`anyhow`], but the page cache has to keep
//! "this page does not exist", "we could not extract it" and "we could not
//! save it" separate, so that a failure is never stored as an empty page.

/// Errors returned by [`crate::notebook::Notebook`].
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// No such document, or no such page in the document.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller asked for something that can never work.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Text layer extraction, rasterization or OCR failed. Nothing was cached,
    /// so the next request will try again.
    #[error("could not extract text from {document} page {page}: {source:#}")]
    Extraction {
        document: String,
        page: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The document itself could not be read, so we can't tell which pages
    /// it has.
    #[error("could not read {document}: {source:#}")]
    Unreadable {
        document: String,
        #[source]
        source: anyhow::Error,
    },

    /// A durable write failed, so the operation did not happen.
    #[error("could not persist data: {0:#}")]
    Persistence(#[source] anyhow::Error),
}

impl PageError {
    /// Build a [`PageError::NotFound`] for a missing document.
    pub fn missing_document(name: &str) -> Self {
        PageError::NotFound(format!("document {name:?}"))
    }

    /// Build a [`PageError::NotFound`] for a page outside the document.
    pub fn missing_page(name: &str, page: u32, page_count: u32) -> Self {
        PageError::NotFound(format!(
            "page {page} of {name:?} (document has {page_count} pages)"
        ))
    }

    /// Build a [`PageError::Extraction`].
    pub fn extraction(document: &str, page: u32, source: anyhow::Error) -> Self {
        PageError::Extraction {
            document: document.to_owned(),
            page,
            source,
        }
    }
}

/// Result type used by the page cache.
pub type NotebookResult<T> = std::result::Result<T, PageError>;
