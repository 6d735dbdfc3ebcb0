#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gateway::command::run().await
}
