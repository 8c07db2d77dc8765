use std::{str::FromStr, sync::Arc};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::NotebookOpts, notebook::Notebook, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod error;
mod identity;
mod normalize;
mod notebook;
mod ocr;
mod prelude;
mod prompt;
mod refine;
mod render;
mod server;
mod source;
mod store;
mod sync;
mod ui;

/// Extract, cache and clean up the text of PDF pages.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the refinement server URL.
  - OPENAI_API_KEY (optional): The key to use for refinement. If neither
    variable is set, `refine` returns normalized text unchanged.

  These variables may be set in a standard `.env` file.

External Tools:
  `pdfinfo`, `pdffonts`, `pdftotext` and `pdftocairo` (from Poppler) and
  `tesseract` must be on the PATH.
"#
)]
struct Opts {
    #[clap(flatten)]
    notebook: NotebookOpts,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Import a PDF file.
    Import(cmd::import::ImportOpts),
    /// List imported documents.
    List,
    /// Print the text of a page or range of pages, extracting it if needed.
    Text(cmd::text::TextOpts),
    /// Replace the stored text of a page.
    Edit(cmd::edit::EditOpts),
    /// Clean up the text of a page using a language model.
    Refine(cmd::refine::RefinePageOpts),
    /// Write selected pages to a text file next to the uploaded PDF.
    Export(cmd::export::ExportOpts),
    /// Delete a document and everything stored for it.
    Delete(cmd::delete::DeleteOpts),
    /// Serve a JSON API.
    Serve(cmd::serve::ServeOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Text(opts) => opts.output_path.is_none(),
            Cmd::Import(_) | Cmd::List | Cmd::Refine(_) | Cmd::Export(_) => true,
            Cmd::Edit(_) | Cmd::Delete(_) | Cmd::Serve(_) => false,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    let notebook = Arc::new(Notebook::open(&opts.notebook).await?);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Import(import_opts) => cmd::import::cmd_import(&notebook, import_opts).await?,
        Cmd::List => cmd::list::cmd_list(&notebook).await?,
        Cmd::Text(text_opts) => cmd::text::cmd_text(ui, &notebook, text_opts).await?,
        Cmd::Edit(edit_opts) => cmd::edit::cmd_edit(&notebook, edit_opts).await?,
        Cmd::Refine(refine_opts) => cmd::refine::cmd_refine(&notebook, refine_opts).await?,
        Cmd::Export(export_opts) => {
            cmd::export::cmd_export(ui, &notebook, export_opts).await?
        }
        Cmd::Delete(delete_opts) => cmd::delete::cmd_delete(&notebook, delete_opts).await?,
        Cmd::Serve(serve_opts) => cmd::serve::cmd_serve(notebook.clone(), serve_opts).await?,
    }
    Ok(())
}
