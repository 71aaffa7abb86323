#[tokio::main]
async fn main() -> anyhow::Result<()> {
    messaging_server::run().await
}
