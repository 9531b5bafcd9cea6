#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ctxforge_controller_runtime::Args::parse_and_run().await
}
