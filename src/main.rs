#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scoreboard_gateway_lib::run().await
}
