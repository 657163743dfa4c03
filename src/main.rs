#[tokio::main]
async fn main() {
    if let Err(e) = provider_sync::run().await {
        tracing::error!(kind = e.kind(), error = %e, "provider-sync failed");
        eprintln!("provider-sync: {e}");
        std::process::exit(1);
    }
}
