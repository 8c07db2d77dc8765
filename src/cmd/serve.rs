//! The `serve` subcommand.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Args;

use crate::{notebook::Notebook, prelude::*, server};

/// Serve command line arguments.
#[derive(Debug, Args)]
pub struct ServeOpts {
    /// The address to listen on.
    #[clap(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// A timeout, in seconds, for each HTTP request.
    #[clap(long, default_value = "600")]
    pub request_timeout: u64,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all, fields(listen = %opts.listen))]
pub async fn cmd_serve(notebook: Arc<Notebook>, opts: &ServeOpts) -> Result<()> {
    server::serve(
        notebook,
        opts.listen,
        Duration::from_secs(opts.request_timeout),
    )
    .await
}
