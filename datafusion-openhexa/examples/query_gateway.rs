//! Example: Query OpenHexa dataset files through the connection gateway
//!
//! Lists the files of a workspace and resolves the download URL of the first
//! few, twice, to show the response cache at work.
//!
//! ## Running
//!
//! ```bash
//! OPENHEXA_API_TOKEN=... \
//! OPENHEXA_WORKSPACE=my-workspace \
//! RUST_LOG=datafusion_openhexa=debug,openhexa_client=debug \
//! cargo run --example query_gateway
//! ```

use datafusion::arrow::util::pretty::print_batches;
use datafusion_openhexa::{CallerIdentity, ConnectionGateway, OpenHexaConfig};
use std::env;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OpenHexaConfig::from_env()?;
    let workspace = env::var("OPENHEXA_WORKSPACE").unwrap_or_default();
    let identity = CallerIdentity::from_user(env::var("OPENHEXA_USER").ok().as_deref());

    println!("OpenHexa endpoint: {}", config.client.url);
    println!("Identity: {}", identity);
    println!();

    let gateway = ConnectionGateway::from_config(config)?;

    let listing = format!(
        "SELECT workspace, dataset, version, filename, file_path \
         FROM list_files('{}') ORDER BY dataset, filename LIMIT 20",
        workspace.replace('\'', "''")
    );
    println!("Query: {}", listing);
    let batches = gateway.handle(&identity, &listing).await?;
    print_batches(&batches)?;
    println!();

    let with_urls = format!(
        "SELECT filename, resolve_url(file_path) AS url \
         FROM list_files('{}') ORDER BY filename LIMIT 3",
        workspace.replace('\'', "''")
    );
    for attempt in ["cold", "warm"] {
        let start = Instant::now();
        let batches = gateway.handle(&identity, &with_urls).await?;
        println!("{} run took {:?}", attempt, start.elapsed());
        print_batches(&batches)?;
    }

    println!();
    println!("URL cache: {}", gateway.cache().urls().stats());
    println!("Listing cache: {}", gateway.cache().listings().stats());
    println!("Active sessions: {:?}", gateway.registry().identities());

    gateway.shutdown().await;
    Ok(())
}
