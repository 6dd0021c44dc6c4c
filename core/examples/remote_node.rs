// rowflow/examples/remote_node.rs

use rowflow::{ClusterSpec, EngineContext, NodeServer, PipelineDefinition, Runner, StageDefinition, StageRegistry};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
  info!("--- Remote Node Example ---");

  // 1. A worker node in the same process. `rowflow-node serve` runs the same server.
  let node = NodeServer::bind("127.0.0.1:0", EngineContext::new(Default::default(), StageRegistry::with_builtins()))
    .await?
    .spawn()?;
  info!(addr = %node.local_addr(), "Worker node up.");

  // 2. `transform` is placed on the node; rows travel there and back in batches.
  let definition = PipelineDefinition::new("distributed")
    .with_cluster(ClusterSpec::new().node("worker-1", node.local_addr().to_string()))
    .stage(StageDefinition::new("read", "generate-rows").with_config(json!({
      "fields": [{ "name": "id", "value_type": "integer" }],
      "rows": [[1], [2], [3], [4]],
      "limit": 1000,
    })))
    .stage(StageDefinition::new("transform", "dummy").on_node("worker-1"))
    .stage(StageDefinition::new("sink", "dummy"))
    .link("read", "transform")
    .link("transform", "sink");

  let engine = EngineContext::new(Default::default(), StageRegistry::with_builtins());
  let result = Runner::new(engine).execute(&definition).await?;
  info!(status = ?result.status, rows = result.totals("sink").rows_read, "Supervisor finished.");
  for nested in result.nested_of("transform") {
    info!(node = ?nested.node, status = ?nested.result.status, "Remote run.");
  }

  node.shutdown();
  Ok(())
}
