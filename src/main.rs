#[tokio::main]
async fn main() -> anyhow::Result<()> {
    catalog_sync::run().await
}
