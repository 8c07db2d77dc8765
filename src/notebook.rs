//! The page cache: uploaded PDFs and their per-page text.
//!
//! Every request for a page's text goes through [`Notebook::text_for`]. If the
//! page is already stored, we return it without doing any extraction work.
//! Otherwise we try the PDF's own text layer, fall back to rasterizing the
//! page and running OCR, normalize the result, store it and return it.
//!
//! At most one extraction runs for any given page at a time. Requests for
//! different pages run independently.
//!
//! Importing over a document or deleting it waits for page work on that
//! document to finish, so no stale text is stored afterwards.

use std::{
    collections::BTreeSet,
    sync::{Arc, LazyLock},
};

use futures::{Stream, StreamExt as _, stream};
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    async_utils::keyed_locks::KeyedLocks,
    config::NotebookOpts,
    error::{NotebookResult, PageError},
    identity::{DocumentId, IdentityResolver},
    normalize::normalize,
    ocr::{OcrEngine, TesseractOcrEngine},
    prelude::*,
    refine::{RefineOutcome, Refiner},
    render::PreviewCache,
    source::{DocumentSource, PopplerSource, TextLayer},
    store::{
        JsonPageStore, PageResult, PageStatus, PageStore, SqlitePageStore, StoreBackend,
        write_atomically,
    },
    sync::{GitSink, MetadataSink, NoopSink},
};

/// Written to exports in place of pages we could not extract.
pub const COULD_NOT_OCR_PAGE: &str = "**COULD_NOT_OCR_PAGE**";

/// Characters we don't allow in stored document names.
static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("failed to compile regex"));

/// Longest export file name we'll try to create.
const MAX_EXPORT_FILE_NAME_LEN: usize = 255;

/// Turn a user-supplied file name into the name we store a document under.
///
/// Directory components are dropped, unusual characters become `_`, and the
/// name must end in `.pdf`.
pub fn sanitize_document_name(raw: &str) -> NotebookResult<String> {
    let file_name = Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| PageError::InvalidInput(format!("not a file name: {raw:?}")))?;
    let name = UNSAFE_NAME_CHARS.replace_all(file_name, "_");
    let name = name.trim_start_matches('.');
    if !name.to_ascii_lowercase().ends_with(".pdf") || name.len() <= ".pdf".len() {
        return Err(PageError::InvalidInput(format!(
            "expected a .pdf file name, got {raw:?}"
        )));
    }
    Ok(name.to_owned())
}

/// Require `name` to be a name [`sanitize_document_name`] could have produced.
fn check_document_name(name: &str) -> NotebookResult<()> {
    if sanitize_document_name(name)? != name {
        return Err(PageError::InvalidInput(format!(
            "invalid document name {name:?}"
        )));
    }
    Ok(())
}

/// The file name for an export of `pages` from `name`.
fn export_file_name(name: &str, pages: &[u32]) -> NotebookResult<String> {
    let base = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name);
    let pages = pages
        .iter()
        .map(|page| page.to_string())
        .collect::<Vec<_>>()
        .join("_");
    let file_name = format!("{base}_pages_{pages}.txt");
    if file_name.len() > MAX_EXPORT_FILE_NAME_LEN {
        return Err(PageError::InvalidInput(
            "too many pages selected for one export file".to_owned(),
        ));
    }
    Ok(file_name)
}

/// Format one page of text the way exports do.
pub fn page_block(page: u32, text: &str) -> String {
    format!("=== Page {page} ===\n{text}\n\n")
}

/// Identifies one page of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub id: DocumentId,
    pub page: u32,
}

/// An uploaded document we've found on disk.
#[derive(Debug, Clone)]
struct Document {
    name: String,
    id: DocumentId,
    path: PathBuf,
}

/// What we know about a document, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub name: String,
    pub id: Option<DocumentId>,
    pub stored_pages: usize,
}

/// The result of [`Notebook::import`].
#[derive(Debug, Clone, Serialize)]
pub struct ImportedDocument {
    pub name: String,
    pub id: DocumentId,
    pub page_count: u32,
}

/// The result of [`Notebook::export`].
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    /// Pages written as [`COULD_NOT_OCR_PAGE`].
    pub failed_pages: Vec<u32>,
}

/// The collaborators a [`Notebook`] is built from.
pub struct NotebookParts {
    pub uploads_dir: PathBuf,
    pub identities: IdentityResolver,
    pub store: Arc<dyn PageStore>,
    pub source: Arc<dyn DocumentSource>,
    pub ocr: Arc<dyn OcrEngine>,
    pub previews: PreviewCache,
    pub refiner: Refiner,
}

/// Uploaded PDFs, plus cached text for their pages.
pub struct Notebook {
    uploads_dir: PathBuf,
    identities: IdentityResolver,
    store: Arc<dyn PageStore>,
    source: Arc<dyn DocumentSource>,
    ocr: Arc<dyn OcrEngine>,
    previews: PreviewCache,
    refiner: Refiner,

    /// How many pages to work on at once in range operations.
    concurrency: usize,

    /// One lock per page with work in progress.
    page_locks: KeyedLocks<PageKey, Mutex<()>>,

    /// One lock per document name. Page work holds it shared, while import
    /// and delete hold it exclusively.
    document_locks: KeyedLocks<String, RwLock<()>>,
}

impl Notebook {
    /// Open the notebook described by `opts`, creating directories and
    /// databases as needed.
    #[instrument(level = "debug", skip_all, fields(data_dir = %opts.store.data_dir.display()))]
    pub async fn open(opts: &NotebookOpts) -> Result<Self> {
        let store_opts = &opts.store;
        let timeout = opts.extract.command_timeout();
        for dir in [store_opts.uploads_dir(), store_opts.pages_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("cannot create {:?}", dir.display()))?;
        }

        let sink: Arc<dyn MetadataSink> = if store_opts.git_sync {
            Arc::new(GitSink::new(
                store_opts.data_dir.clone(),
                store_opts.git_remote.clone(),
                store_opts.git_branch.clone(),
                timeout,
            ))
        } else {
            Arc::new(NoopSink)
        };
        let store: Arc<dyn PageStore> = match store_opts.store {
            StoreBackend::Json => {
                Arc::new(JsonPageStore::open(store_opts.pages_dir(), sink.clone()).await?)
            }
            StoreBackend::Sqlite => {
                Arc::new(SqlitePageStore::open(store_opts.database_path()).await?)
            }
        };
        let identities = IdentityResolver::open(store_opts.index_path(), sink).await?;
        let previews =
            PreviewCache::open(store_opts.previews_dir(), opts.extract.dpi).await?;
        let refiner = Refiner::new(opts.refine.to_refiner_config().await?);

        Ok(Self::from_parts(NotebookParts {
            uploads_dir: store_opts.uploads_dir(),
            identities,
            store,
            source: Arc::new(PopplerSource::new(timeout)),
            ocr: Arc::new(TesseractOcrEngine::new(timeout)),
            previews,
            refiner,
        }))
    }

    /// Assemble a notebook from its parts.
    pub fn from_parts(parts: NotebookParts) -> Self {
        Self {
            uploads_dir: parts.uploads_dir,
            identities: parts.identities,
            store: parts.store,
            source: parts.source,
            ocr: parts.ocr,
            previews: parts.previews,
            refiner: parts.refiner,
            concurrency: num_cpus::get().max(1),
            page_locks: KeyedLocks::new(),
            document_locks: KeyedLocks::new(),
        }
    }

    /// Every document we know about, sorted by name.
    pub async fn documents(&self) -> NotebookResult<Vec<DocumentSummary>> {
        let mut names = self
            .identities
            .names()
            .await
            .into_iter()
            .collect::<BTreeSet<_>>();
        let mut entries = tokio::fs::read_dir(&self.uploads_dir)
            .await
            .with_context(|| format!("cannot list {:?}", self.uploads_dir.display()))
            .map_err(PageError::Persistence)?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("cannot list uploads")
            .map_err(PageError::Persistence)?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if check_document_name(&file_name).is_ok() {
                names.insert(file_name);
            }
        }

        let mut summaries = Vec::with_capacity(names.len());
        for name in names {
            let id = self.identities.lookup(&name).await;
            let stored_pages = match &id {
                Some(id) => self
                    .store
                    .pages(id)
                    .await
                    .map_err(PageError::Persistence)?
                    .len(),
                None => 0,
            };
            summaries.push(DocumentSummary {
                name,
                id,
                stored_pages,
            });
        }
        Ok(summaries)
    }

    /// Store an uploaded PDF under a sanitized version of `name`.
    ///
    /// Importing over an existing document keeps its identifier but throws
    /// away its stored pages and images, since the contents may have changed.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub async fn import(&self, name: &str, data: Vec<u8>) -> NotebookResult<ImportedDocument> {
        let name = sanitize_document_name(name)?;
        if infer::get(&data).map(|kind| kind.mime_type()) != Some("application/pdf") {
            return Err(PageError::InvalidInput(format!(
                "{name:?} does not look like a PDF file"
            )));
        }

        // Write somewhere private first, so we can check the PDF before it
        // replaces anything.
        let staged = self.uploads_dir.join(format!(".upload-{}.pdf", Uuid::new_v4()));
        write_atomically(&staged, data)
            .await
            .map_err(PageError::Persistence)?;
        let page_count = match self.source.page_count(&staged).await {
            Ok(page_count) => page_count,
            Err(err) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(PageError::InvalidInput(format!(
                    "cannot read {name:?} as a PDF: {err:#}"
                )));
            }
        };

        let document_lock = self.document_locks.get(name.clone());
        let _writing = document_lock.write().await;
        if let Some(old_id) = self.identities.lookup(&name).await {
            debug!(%old_id, "Replacing existing document");
            self.store
                .delete(&old_id)
                .await
                .map_err(PageError::Persistence)?;
            self.previews
                .remove_document(&name)
                .await
                .map_err(PageError::Persistence)?;
        }
        let path = self.uploads_dir.join(&name);
        if let Err(err) = tokio::fs::rename(&staged, &path).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(PageError::Persistence(anyhow::Error::new(err).context(
                format!("cannot move upload to {:?}", path.display()),
            )));
        }
        let id = self
            .identities
            .resolve(&name)
            .await
            .map_err(PageError::Persistence)?;
        info!(%name, %id, page_count, "Imported document");
        Ok(ImportedDocument {
            name,
            id,
            page_count,
        })
    }

    /// Find an uploaded document and its identifier.
    async fn locate(&self, name: &str) -> NotebookResult<Document> {
        check_document_name(name)?;
        let path = self.uploads_dir.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(PageError::missing_document(name));
        }
        let id = self
            .identities
            .resolve(name)
            .await
            .map_err(PageError::Persistence)?;
        Ok(Document {
            name: name.to_owned(),
            id,
            path,
        })
    }

    /// How many pages does `doc` have?
    async fn count_pages(&self, doc: &Document) -> NotebookResult<u32> {
        self.source
            .page_count(&doc.path)
            .await
            .map_err(|source| PageError::Unreadable {
                document: doc.name.clone(),
                source,
            })
    }

    /// Fail unless `page` is in `1..=page_count`.
    async fn check_page(&self, doc: &Document, page: u32) -> NotebookResult<()> {
        let page_count = self.count_pages(doc).await?;
        if page == 0 || page > page_count {
            return Err(PageError::missing_page(&doc.name, page, page_count));
        }
        Ok(())
    }

    /// How many pages does the document `name` have?
    pub async fn page_count(&self, name: &str) -> NotebookResult<u32> {
        let doc = self.locate(name).await?;
        self.count_pages(&doc).await
    }

    /// Look up the stored result for a page, without extracting anything.
    pub async fn page_result(&self, name: &str, page: u32) -> NotebookResult<Option<PageResult>> {
        let doc = self.locate(name).await?;
        self.store
            .get(&doc.id, page)
            .await
            .map_err(PageError::Persistence)
    }

    /// Get the text of a page, extracting and storing it if necessary.
    pub async fn text_for(&self, name: &str, page: u32) -> NotebookResult<String> {
        Ok(self.fetch_page(name, page).await?.text)
    }

    /// Like [`Notebook::text_for`], but also returns the page's status.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_page(&self, name: &str, page: u32) -> NotebookResult<PageResult> {
        let document_lock = self.document_locks.get(name.to_owned());
        let _reading = document_lock.read().await;
        let doc = self.locate(name).await?;
        self.fetch_located_page(&doc, page).await
    }

    /// Get a page of `doc`, extracting it if needed. The caller must hold the
    /// document's lock.
    async fn fetch_located_page(&self, doc: &Document, page: u32) -> NotebookResult<PageResult> {
        let key = PageKey { id: doc.id, page };
        if let Some(result) = self.stored(&key).await? {
            trace!("Cache hit");
            return Ok(result);
        }

        self.with_page_lock(key, || async {
            // Someone else may have finished this page while we waited.
            if let Some(result) = self.stored(&key).await? {
                debug!("Page was extracted by a concurrent request");
                return Ok(result);
            }
            self.check_page(doc, page).await?;
            let raw = self.extract(doc, page).await?;
            let result = PageResult::new(normalize(&raw), PageStatus::Extracted);
            self.store
                .put(&doc.id, page, &result)
                .await
                .map_err(PageError::Persistence)?;
            debug!(chars = result.text.len(), "Stored extracted page");
            Ok(result)
        })
        .await
    }

    /// Extract the raw text of a page: the text layer if it has any text,
    /// otherwise OCR.
    async fn extract(&self, doc: &Document, page: u32) -> NotebookResult<String> {
        let failed = |source| PageError::extraction(&doc.name, page, source);
        match self.source.text_layer(&doc.path, page).await.map_err(failed)? {
            TextLayer::Present(text) if !text.trim().is_empty() => {
                debug!("Using text layer");
                return Ok(text);
            }
            TextLayer::Present(_) => debug!("Text layer is blank, falling back to OCR"),
            TextLayer::Absent => debug!("No text layer, falling back to OCR"),
        }
        let image = self
            .previews
            .get_or_render(&*self.source, &doc.path, &doc.name, page)
            .await
            .map_err(failed)?;
        self.ocr.ocr_image(&image).await.map_err(failed)
    }

    /// Replace the text of a page with text supplied by a person.
    #[instrument(level = "debug", skip(self, text))]
    pub async fn edit(&self, name: &str, page: u32, text: String) -> NotebookResult<PageResult> {
        let document_lock = self.document_locks.get(name.to_owned());
        let _reading = document_lock.read().await;
        let doc = self.locate(name).await?;
        self.check_page(&doc, page).await?;
        let result = PageResult::new(text, PageStatus::Edited);
        let key = PageKey { id: doc.id, page };
        self.with_page_lock(key, || async {
            self.store
                .put(&doc.id, page, &result)
                .await
                .map_err(PageError::Persistence)
        })
        .await?;
        info!("Saved edited text");
        Ok(result)
    }

    /// Ask the refinement service to clean up a page, extracting it first if
    /// needed.
    ///
    /// If refinement succeeds, the refined text is stored. Otherwise nothing
    /// is stored and we return the normalized text with its existing status.
    /// The document cannot be replaced or deleted until we're done.
    #[instrument(level = "debug", skip(self))]
    pub async fn refine_page(&self, name: &str, page: u32) -> NotebookResult<PageResult> {
        let document_lock = self.document_locks.get(name.to_owned());
        let _reading = document_lock.read().await;
        let doc = self.locate(name).await?;
        let current = self.fetch_located_page(&doc, page).await?;

        // The page lock is not held while the request is in flight.
        let outcome = self.refiner.refine(&current.text).await;
        match outcome {
            RefineOutcome::Refined(text) => {
                let result = PageResult::new(text, PageStatus::Refined);
                let key = PageKey { id: doc.id, page };
                self.with_page_lock(key, || async {
                    self.store
                        .put(&doc.id, page, &result)
                        .await
                        .map_err(PageError::Persistence)
                })
                .await?;
                info!("Saved refined text");
                Ok(result)
            }
            RefineOutcome::Declined { reason } => {
                info!(%reason, "Refinement skipped");
                Ok(PageResult::new(normalize(&current.text), current.status))
            }
            outcome @ RefineOutcome::Failed(_) => Ok(PageResult::new(
                outcome.into_text(&current.text),
                current.status,
            )),
        }
    }

    /// Get an image of a page, rendering it if needed.
    pub async fn preview(&self, name: &str, page: u32) -> NotebookResult<PathBuf> {
        let document_lock = self.document_locks.get(name.to_owned());
        let _reading = document_lock.read().await;
        let doc = self.locate(name).await?;
        self.check_page(&doc, page).await?;
        self.previews
            .get_or_render(&*self.source, &doc.path, &doc.name, page)
            .await
            .map_err(|source| PageError::extraction(&doc.name, page, source))
    }

    /// The pages from `start` through `end` (or just `start`), clipped to the
    /// end of the document.
    pub async fn pages_in_range(
        &self,
        name: &str,
        start: u32,
        end: Option<u32>,
    ) -> NotebookResult<Vec<u32>> {
        let end = end.unwrap_or(start);
        if start == 0 || end < start {
            return Err(PageError::InvalidInput(format!(
                "invalid page range {start}-{end}"
            )));
        }
        let doc = self.locate(name).await?;
        let page_count = self.count_pages(&doc).await?;
        if start > page_count {
            return Err(PageError::missing_page(name, start, page_count));
        }
        Ok((start..=end.min(page_count)).collect())
    }

    /// Get the text of several pages, a few at a time, in order.
    pub fn page_texts<'a>(
        &'a self,
        name: &'a str,
        pages: Vec<u32>,
    ) -> impl Stream<Item = (u32, NotebookResult<String>)> + 'a {
        stream::iter(pages)
            .map(move |page| async move { (page, self.text_for(name, page).await) })
            .buffered(self.concurrency)
    }

    /// Get the text of pages `start` through `end`. Each page succeeds or
    /// fails separately.
    pub async fn text_range(
        &self,
        name: &str,
        start: u32,
        end: Option<u32>,
    ) -> NotebookResult<Vec<(u32, NotebookResult<String>)>> {
        let pages = self.pages_in_range(name, start, end).await?;
        Ok(self.page_texts(name, pages).collect().await)
    }

    /// Write the text of `pages` to a text file next to the upload.
    ///
    /// Pages which cannot be extracted are written as [`COULD_NOT_OCR_PAGE`].
    #[instrument(level = "debug", skip(self))]
    pub async fn export(&self, name: &str, pages: &[u32]) -> NotebookResult<ExportReport> {
        if pages.is_empty() {
            return Err(PageError::InvalidInput("no pages selected".to_owned()));
        }
        let file_name = export_file_name(name, pages)?;
        let doc = self.locate(name).await?;
        let page_count = self.count_pages(&doc).await?;
        if let Some(&page) = pages.iter().find(|&&page| page == 0 || page > page_count) {
            return Err(PageError::missing_page(name, page, page_count));
        }

        let texts = self
            .page_texts(name, pages.to_vec())
            .collect::<Vec<_>>()
            .await;
        let mut output = String::new();
        let mut failed_pages = vec![];
        for (page, text) in texts {
            match text {
                Ok(text) => output.push_str(&page_block(page, &text)),
                Err(err @ PageError::Extraction { .. }) => {
                    warn!(page, "Exporting failed page as a marker: {}", err);
                    failed_pages.push(page);
                    output.push_str(&page_block(page, COULD_NOT_OCR_PAGE));
                }
                Err(err) => return Err(err),
            }
        }

        let path = self.uploads_dir.join(file_name);
        write_atomically(&path, output.into_bytes())
            .await
            .map_err(PageError::Persistence)?;
        info!(path = %path.display(), pages = pages.len(), "Exported pages");
        Ok(ExportReport { path, failed_pages })
    }

    /// Remove a document: stored pages, page images, the upload and finally
    /// the name mapping.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, name: &str) -> NotebookResult<()> {
        check_document_name(name)?;
        let document_lock = self.document_locks.get(name.to_owned());
        let _writing = document_lock.write().await;
        let id = self.identities.lookup(name).await;
        let path = self.uploads_dir.join(name);
        let uploaded = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if id.is_none() && !uploaded {
            return Err(PageError::missing_document(name));
        }

        if let Some(id) = &id {
            self.store
                .delete(id)
                .await
                .map_err(PageError::Persistence)?;
        }
        self.previews
            .remove_document(name)
            .await
            .map_err(PageError::Persistence)?;
        if uploaded {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(PageError::Persistence(anyhow::Error::new(err).context(
                        format!("cannot delete {:?}", path.display()),
                    )));
                }
            }
        }
        self.identities
            .forget(name)
            .await
            .map_err(PageError::Persistence)?;
        info!("Deleted document");
        Ok(())
    }

    /// Read a page from the store.
    async fn stored(&self, key: &PageKey) -> NotebookResult<Option<PageResult>> {
        self.store
            .get(&key.id, key.page)
            .await
            .map_err(PageError::Persistence)
    }

    /// Run `f` while holding the lock for `key`.
    async fn with_page_lock<F, Fut, T>(&self, key: PageKey, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let page_lock = self.page_locks.get(key);
        let _guard = page_lock.lock().await;
        f().await
    }
}
