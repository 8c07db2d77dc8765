//! Reading command input and writing command output.
//!
//! Subcommands read from a file or standard input, and write to a file or
//! standard output, depending on whether they were given a path.

use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Read all of a file, or all of standard input if `path` is `None`.
pub async fn read_to_string(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read file at path: {:?}", path)),
        None => {
            let mut data = String::new();
            tokio::io::stdin()
                .read_to_string(&mut data)
                .await
                .context("Failed to read standard input")?;
            Ok(data)
        }
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write `chunks` to a file or stdout, in order.
pub async fn write_output<I>(path: Option<&Path>, chunks: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    for chunk in chunks {
        writer
            .write_all(chunk.as_ref().as_bytes())
            .await
            .context("Failed to write output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
