#[tokio::main]
async fn main() -> anyhow::Result<()> {
    veo_studio::run().await
}
