//! The `edit` subcommand.

use clap::Args;

use crate::{async_utils::io::read_to_string, notebook::Notebook, prelude::*};

/// Edit command line arguments.
#[derive(Debug, Args)]
pub struct EditOpts {
    /// The document name.
    pub name: String,

    /// The page to replace, starting at 1.
    pub page: u32,

    /// Read the new text from this file instead of standard input.
    #[clap(long)]
    pub file: Option<PathBuf>,
}

/// The `edit` subcommand.
#[instrument(level = "debug", skip_all, fields(name = %opts.name, page = opts.page))]
pub async fn cmd_edit(notebook: &Notebook, opts: &EditOpts) -> Result<()> {
    let text = read_to_string(opts.file.as_deref()).await?;
    notebook.edit(&opts.name, opts.page, text).await?;
    Ok(())
}
