use std::time::Duration;

use tokio::io::BufReader;
use tracing::{info, warn};

use strata_infra::{PumpConfig, RuntimeConfig};
use strata_node::app::Node;
use strata_node::ingest::ingest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env()?;
    strata_observability::init(&config.observability());

    let node = Node::build(&config).await?;
    let pump = node.start_pump(PumpConfig::default().with_name(format!("{}-pump", config.task_queue)));
    info!(task_queue = %config.task_queue, "reading commands from stdin");

    let stats = ingest(BufReader::new(tokio::io::stdin()), node.log.as_ref()).await?;
    info!(
        accepted = stats.accepted,
        duplicates = stats.duplicates,
        malformed = stats.malformed,
        "input closed"
    );

    if !node.drain(config.context_ttl.max(Duration::from_secs(1))).await {
        warn!("commands still pending at shutdown");
    }
    let pump_stats = pump.stats();
    pump.shutdown().await;
    info!(
        processed = pump_stats.processed,
        failed = pump_stats.failed,
        unroutable = pump_stats.unroutable,
        "node stopped"
    );
    Ok(())
}
