//! Warm pool commands for `worldgen pool`.

use anyhow::Result;
use worldgen::common::EngineState;
use worldgen::config::Settings;
use worldgen::pool::WarmEnginePool;

use super::docker_orchestrator;
use crate::PoolCommands;

pub async fn cmd_pool(settings: &Settings, command: PoolCommands) -> Result<()> {
    let pool = WarmEnginePool::new(docker_orchestrator(settings)?, settings);
    let adopted = pool.discover_existing().await?;
    tracing::debug!(adopted, "discovered running engines");

    match command {
        PoolCommands::Status => {
            let status = pool.status().await;
            println!(
                "Pool: {}/{} engines ({} ready, {} generating)",
                status.pool_size,
                status.max_pool_size,
                status.count_in(EngineState::Ready),
                status.count_in(EngineState::Generating),
            );
            for engine in &status.engines {
                println!(
                    "  {}  {:<10}  jobs={}  last_used={}",
                    engine.id,
                    engine.state.as_str(),
                    engine.jobs_processed,
                    engine.last_used_at.to_rfc3339()
                );
            }
        }
        PoolCommands::Warm { count } => {
            let target = count.min(settings.pool.max_pool_size);
            let mut started = 0;
            while pool.status().await.pool_size < target {
                let id = pool.create_engine(None).await?;
                println!("Started engine {id}");
                started += 1;
            }
            println!("{started} engine(s) started");
        }
        PoolCommands::Cleanup => {
            let unhealthy = pool.check_health().await;
            let expired = pool.cleanup_expired().await;
            println!(
                "Removed {} unhealthy and {} expired engine(s)",
                unhealthy.len(),
                expired.len()
            );
        }
        PoolCommands::Shutdown => {
            let removed = pool.shutdown_all().await;
            println!("Shut down {removed} engine(s)");
        }
    }
    Ok(())
}
