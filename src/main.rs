#[tokio::main]
async fn main() -> anyhow::Result<()> {
    remy::run().await
}
