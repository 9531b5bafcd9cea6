#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ctxforge_forwarder::Args::parse_and_run().await
}
