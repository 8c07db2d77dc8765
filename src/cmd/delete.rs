//! The `delete` subcommand.

use clap::Args;

use crate::{notebook::Notebook, prelude::*};

/// Delete command line arguments.
#[derive(Debug, Args)]
pub struct DeleteOpts {
    /// The document to delete, with all its stored pages and images.
    pub name: String,
}

/// The `delete` subcommand.
#[instrument(level = "debug", skip_all, fields(name = %opts.name))]
pub async fn cmd_delete(notebook: &Notebook, opts: &DeleteOpts) -> Result<()> {
    notebook.delete(&opts.name).await?;
    Ok(())
}
