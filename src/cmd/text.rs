//! The `text` subcommand.

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::io::write_output,
    error::PageError,
    notebook::{COULD_NOT_OCR_PAGE, Notebook, page_block},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Text command line arguments.
#[derive(Debug, Args)]
pub struct TextOpts {
    /// The document name, as shown by `list`.
    pub name: String,

    /// The first page to print, starting at 1.
    pub start: u32,

    /// The last page to print. Defaults to `start`. Clipped to the end of the
    /// document.
    pub end: Option<u32>,

    /// Write the text here instead of to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `text` subcommand.
#[instrument(level = "debug", skip_all, fields(name = %opts.name))]
pub async fn cmd_text(ui: Ui, notebook: &Notebook, opts: &TextOpts) -> Result<()> {
    let pages = notebook
        .pages_in_range(&opts.name, opts.start, opts.end)
        .await?;

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Extracting pages",
            done_msg: "Extracted pages",
        },
        pages.len() as u64,
    );
    let results = pb
        .wrap_stream(Box::pin(notebook.page_texts(&opts.name, pages)))
        .collect::<Vec<_>>()
        .await;

    let mut blocks = Vec::with_capacity(results.len());
    let mut failed = 0;
    for (page, result) in results {
        match result {
            Ok(text) => blocks.push(page_block(page, &text)),
            Err(err @ PageError::Extraction { .. }) => {
                error!("{}", err);
                failed += 1;
                blocks.push(page_block(page, COULD_NOT_OCR_PAGE));
            }
            Err(err) => return Err(err.into()),
        }
    }
    write_output(opts.output_path.as_deref(), &blocks).await?;

    if failed > 0 {
        return Err(anyhow!("could not extract {} page(s)", failed));
    }
    Ok(())
}
