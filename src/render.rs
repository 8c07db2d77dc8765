//! Cached page images.
//!
//! Rasterized pages serve as OCR input and as previews. They are derived
//! data: any of them may be deleted at any time and will be re-rendered on
//! demand.

use regex::Regex;
use uuid::Uuid;

use crate::{prelude::*, source::DocumentSource};

/// A directory of rendered page images, keyed by document name, page and DPI.
#[derive(Debug, Clone)]
pub struct PreviewCache {
    dir: PathBuf,
    dpi: u32,
}

impl PreviewCache {
    /// Create a cache in `dir`, rendering at `dpi`.
    pub async fn open(dir: PathBuf, dpi: u32) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create preview directory {:?}", dir.display()))?;
        Ok(Self { dir, dpi })
    }

    /// Where the image for `page` of `name` lives.
    pub fn path_for(&self, name: &str, page: u32) -> PathBuf {
        self.dir
            .join(format!("{}_p{}_{}dpi.png", name, page, self.dpi))
    }

    /// Return the cached image for `page` of `name`, rendering it from
    /// `doc_path` first if needed.
    ///
    /// Rendering goes to a temporary file which is then renamed into place,
    /// so readers never see a half-written image, and two concurrent renders
    /// of the same page just replace each other with equivalent files.
    #[instrument(level = "debug", skip(self, source, doc_path))]
    pub async fn get_or_render(
        &self,
        source: &dyn DocumentSource,
        doc_path: &Path,
        name: &str,
        page: u32,
    ) -> Result<PathBuf> {
        let path = self.path_for(name, page);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            trace!("Using cached page image");
            return Ok(path);
        }

        let tmp = self.dir.join(format!(".render-{}.png", Uuid::new_v4()));
        if let Err(err) = source.rasterize(doc_path, page, self.dpi, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(anyhow::Error::new(err)
                .context(format!("cannot move page image to {:?}", path.display())));
        }
        debug!(path = %path.display(), "Rendered page image");
        Ok(path)
    }

    /// Delete every cached image of `name`, at any DPI.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_document(&self, name: &str) -> Result<()> {
        let pattern = Regex::new(&format!(r"^{}_p\d+_\d+dpi\.png$", regex::escape(name)))
            .context("cannot build preview file pattern")?;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("cannot list {:?}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if pattern.is_match(&file_name.to_string_lossy()) {
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("cannot delete {:?}", entry.path().display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::source::TextLayer;

    use super::*;

    /// Writes a fake PNG and counts how often it was asked to.
    #[derive(Default)]
    struct CountingRasterizer {
        renders: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSource for CountingRasterizer {
        async fn page_count(&self, _path: &Path) -> Result<u32> {
            Ok(1)
        }

        async fn text_layer(&self, _path: &Path, _page: u32) -> Result<TextLayer> {
            Ok(TextLayer::Absent)
        }

        async fn rasterize(
            &self,
            _path: &Path,
            page: u32,
            dpi: u32,
            out_png: &Path,
        ) -> Result<()> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(out_png, format!("png {page} {dpi}")).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn renders_once_then_reuses() {
        let dir = tempfile::TempDir::with_prefix("previews").unwrap();
        let cache = PreviewCache::open(dir.path().to_owned(), 200).await.unwrap();
        let source = CountingRasterizer::default();

        let first = cache
            .get_or_render(&source, Path::new("doc.pdf"), "doc.pdf", 2)
            .await
            .unwrap();
        let second = cache
            .get_or_render(&source, Path::new("doc.pdf"), "doc.pdf", 2)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.file_name().unwrap(), "doc.pdf_p2_200dpi.png");
        assert_eq!(source.renders.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "png 2 200");
    }

    #[tokio::test]
    async fn failed_renames_leave_no_temporary_files() {
        let dir = tempfile::TempDir::with_prefix("previews").unwrap();
        let cache = PreviewCache::open(dir.path().to_owned(), 200).await.unwrap();
        let source = CountingRasterizer::default();

        // A non-empty directory in the way makes the rename fail.
        let blocker = cache.path_for("doc.pdf", 1);
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();
        cache
            .get_or_render(&source, Path::new("doc.pdf"), "doc.pdf", 1)
            .await
            .unwrap_err();

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".render-"))
            .collect::<Vec<_>>();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn remove_document_only_touches_that_document() {
        let dir = tempfile::TempDir::with_prefix("previews").unwrap();
        let cache = PreviewCache::open(dir.path().to_owned(), 200).await.unwrap();
        let source = CountingRasterizer::default();
        for (name, page) in [("a.pdf", 1), ("a.pdf", 2), ("a.pdf_p1.pdf", 1)] {
            cache
                .get_or_render(&source, Path::new(name), name, page)
                .await
                .unwrap();
        }

        cache.remove_document("a.pdf").await.unwrap();
        assert!(!cache.path_for("a.pdf", 1).exists());
        assert!(!cache.path_for("a.pdf", 2).exists());
        assert!(cache.path_for("a.pdf_p1.pdf", 1).exists());
    }
}
