#[tokio::main]
async fn main() -> anyhow::Result<()> {
    worker_agent::command::run().await
}
