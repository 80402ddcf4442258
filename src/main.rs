use anyhow::Result;
use clap::Parser;
use codeact_analyst::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    codeact_analyst::run(args).await
}
