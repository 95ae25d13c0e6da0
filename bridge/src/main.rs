mod api;
mod coordinator;
mod fetch;
mod host;
mod publish;
mod reset;
mod session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
