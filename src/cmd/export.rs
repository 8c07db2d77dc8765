//! The `export` subcommand.

use clap::Args;

use crate::{
    notebook::Notebook,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Export command line arguments.
#[derive(Debug, Args)]
pub struct ExportOpts {
    /// The document name.
    pub name: String,

    /// The pages to export, in the order they should appear.
    #[clap(required = true)]
    pub pages: Vec<u32>,
}

/// The `export` subcommand. Prints the path of the exported file.
#[instrument(level = "debug", skip_all, fields(name = %opts.name))]
pub async fn cmd_export(ui: Ui, notebook: &Notebook, opts: &ExportOpts) -> Result<()> {
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "📦",
        msg: "Exporting pages",
        done_msg: "Exported pages",
    });
    let report = notebook.export(&opts.name, &opts.pages).await?;
    spinner.finish_using_style();

    if !report.failed_pages.is_empty() {
        warn!(
            "Could not extract pages {:?}; they are marked in the export",
            report.failed_pages
        );
    }
    println!("{}", report.path.display());
    Ok(())
}
