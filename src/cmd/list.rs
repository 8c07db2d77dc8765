//! The `list` subcommand.

use crate::{notebook::Notebook, prelude::*};

/// The `list` subcommand. Prints one tab-separated line per document.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_list(notebook: &Notebook) -> Result<()> {
    for doc in notebook.documents().await? {
        let id = doc.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_owned());
        println!("{}\t{}\t{} stored pages", doc.name, id, doc.stored_pages);
    }
    Ok(())
}
