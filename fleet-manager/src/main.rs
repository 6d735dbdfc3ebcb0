#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleet_manager::command::run().await
}
