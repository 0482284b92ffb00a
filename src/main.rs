//! APMRouter CLI entry point.

use apmrouter::cli::{self, Cli};
use apmrouter::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    cli::execute(cli).await
}
