#[tokio::main]
async fn main() -> anyhow::Result<()> {
    historify::run().await
}
