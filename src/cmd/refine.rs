//! The `refine` subcommand.

use clap::Args;

use crate::{notebook::Notebook, prelude::*, store::PageStatus};

/// Refine command line arguments.
#[derive(Debug, Args)]
pub struct RefinePageOpts {
    /// The document name.
    pub name: String,

    /// The page to refine, starting at 1.
    pub page: u32,
}

/// The `refine` subcommand. Prints the page text, refined or not.
#[instrument(level = "debug", skip_all, fields(name = %opts.name, page = opts.page))]
pub async fn cmd_refine(notebook: &Notebook, opts: &RefinePageOpts) -> Result<()> {
    let result = notebook.refine_page(&opts.name, opts.page).await?;
    if result.status != PageStatus::Refined {
        warn!(status = %result.status, "Page was not refined");
    }
    println!("{}", result.text);
    Ok(())
}
