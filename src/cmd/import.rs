//! The `import` subcommand.

use clap::Args;

use crate::{notebook::Notebook, prelude::*};

/// Import command line arguments.
#[derive(Debug, Args)]
pub struct ImportOpts {
    /// The PDF file to import.
    pub path: PathBuf,

    /// Store the document under this name, instead of the file's own name.
    #[clap(long)]
    pub name: Option<String>,
}

/// The `import` subcommand.
#[instrument(level = "debug", skip_all, fields(path = %opts.path.display()))]
pub async fn cmd_import(notebook: &Notebook, opts: &ImportOpts) -> Result<()> {
    let name = match &opts.name {
        Some(name) => name.to_owned(),
        None => opts
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("no file name in {:?}", opts.path.display()))?,
    };
    let data = tokio::fs::read(&opts.path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", opts.path))?;
    let imported = notebook.import(&name, data).await?;
    println!(
        "{}\t{}\t{} pages",
        imported.name, imported.id, imported.page_count
    );
    Ok(())
}
