//! Command-line and environment configuration.
//!
//! Everything is configured with command-line flags, except for API
//! credentials, which come from the environment (or a `.env` file).

use std::time::Duration;

use clap::Args;

use crate::{
    prelude::*,
    prompt::ChatPrompt,
    refine::{RefinerConfig, default_refine_prompt},
    store::StoreBackend,
};

/// The OpenAI API, used when `OPENAI_API_KEY` is set without
/// `OPENAI_API_BASE`.
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Where and how we store data.
#[derive(Args, Clone, Debug)]
pub struct StoreOpts {
    /// Directory holding uploaded PDFs, stored page text and page images.
    #[clap(long, global = true, default_value = "data")]
    pub data_dir: PathBuf,

    /// How to store page text.
    #[clap(long, global = true, value_enum, default_value_t = StoreBackend::default())]
    pub store: StoreBackend,

    /// Commit and push stored files after each write. The data directory must
    /// be inside a git working tree.
    #[clap(long, global = true)]
    pub git_sync: bool,

    /// The git remote to push to.
    #[clap(long, global = true, default_value = "origin")]
    pub git_remote: String,

    /// The git branch to push.
    #[clap(long, global = true, default_value = "main")]
    pub git_branch: String,
}

impl StoreOpts {
    /// Uploaded PDFs and exported text files.
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// The JSON page store, including the document index.
    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }

    /// The document name to identifier index.
    pub fn index_path(&self) -> PathBuf {
        self.pages_dir().join("index.json")
    }

    /// The SQLite database, if we're using one.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("ocr_data.db")
    }

    /// Rendered page images.
    pub fn previews_dir(&self) -> PathBuf {
        self.data_dir.join("previews")
    }
}

/// How we extract text.
#[derive(Args, Clone, Debug)]
pub struct ExtractOpts {
    /// The DPI to use when rasterizing pages for OCR and previews.
    #[clap(long, global = true, default_value = "200")]
    pub dpi: u32,

    /// A timeout, in seconds, for each external command (`pdftotext`,
    /// `pdftocairo`, `tesseract`, `git`).
    #[clap(long, global = true, default_value = "120")]
    pub command_timeout: u64,
}

impl ExtractOpts {
    /// Our command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

/// How we refine text.
#[derive(Args, Clone, Debug)]
pub struct RefineOpts {
    /// The model to use for refinement.
    #[clap(long, global = true, default_value = "gpt-4o-mini")]
    pub refine_model: String,

    /// A timeout, in seconds, for each refinement request.
    #[clap(long, global = true, default_value = "60")]
    pub refine_timeout: u64,

    /// A TOML prompt file to use instead of the built-in refinement prompt.
    /// The page text is available as `{{text}}`.
    #[clap(long, global = true)]
    pub refine_prompt: Option<PathBuf>,
}

impl RefineOpts {
    /// Build a [`RefinerConfig`], reading credentials from the environment.
    pub async fn to_refiner_config(&self) -> Result<RefinerConfig> {
        let prompt = match &self.refine_prompt {
            Some(path) => ChatPrompt::from_path(path).await?,
            None => default_refine_prompt(),
        };
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let api_base = std::env::var("OPENAI_API_BASE")
            .ok()
            .or_else(|| api_key.as_ref().map(|_| DEFAULT_OPENAI_API_BASE.to_owned()));
        Ok(RefinerConfig {
            api_base,
            api_key,
            model: self.refine_model.clone(),
            timeout: Duration::from_secs(self.refine_timeout),
            prompt,
        })
    }
}

/// Everything needed to open a [`crate::notebook::Notebook`].
#[derive(Args, Clone, Debug)]
pub struct NotebookOpts {
    #[clap(flatten)]
    pub store: StoreOpts,

    #[clap(flatten)]
    pub extract: ExtractOpts,

    #[clap(flatten)]
    pub refine: RefineOpts,
}
