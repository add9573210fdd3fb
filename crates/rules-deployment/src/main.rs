//! 规则部署服务
//!
//! 加载资产种子和规则目录，按作用域运行规则部署，直到收到关闭信号。

use anyhow::Result;
use rule_engine::JsonRuleEngine;
use rules_deployment::loader::{load_assets_file, load_rules_dir};
use rules_deployment::{
    AttributePipeline, DelayQueueScheduler, DeploymentContext, DeploymentManager, EventSink,
    InMemoryAssetStore, RestartScheduler,
};
use rules_shared::config::AppConfig;
use rules_shared::observability;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("rules-deployment").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: "rules-deployment".to_string(),
            ..AppConfig::default()
        }
    });

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(environment = %config.environment, "Starting rules-deployment service...");

    let store = Arc::new(InMemoryAssetStore::new());
    if let Some(path) = &config.deployment.assets_file {
        match load_assets_file(Path::new(path)) {
            Ok(entities) => {
                let count = entities.len();
                for entity in entities {
                    store.insert(entity);
                }
                info!(count, path = %path, "资产种子已加载");
            }
            Err(e) => warn!(error = %e, "加载资产种子失败，以空资产存储启动"),
        }
    }

    let pipeline = Arc::new(AttributePipeline::new(store.clone()));
    let scheduler = Arc::new(DelayQueueScheduler::new());
    let restart = RestartScheduler::new(scheduler.clone(), config.deployment.restart_delay());

    let ctx = DeploymentContext {
        engine: Arc::new(JsonRuleEngine::new()),
        store: store.clone(),
        processor: pipeline.clone(),
        restart,
        fact_count_warn_delta: config.deployment.fact_count_warn_delta,
    };
    let manager = Arc::new(DeploymentManager::new(ctx));

    let sink: Weak<dyn EventSink> = Arc::downgrade(&manager) as Weak<dyn EventSink>;
    pipeline.connect(sink);

    if let Some(dir) = &config.deployment.rules_dir {
        match load_rules_dir(&manager, Path::new(dir)) {
            Ok(deployed) => info!(deployed, scopes = manager.len(), "规则集已加载"),
            Err(e) => warn!(error = %e, "加载规则目录失败，以空部署启动"),
        }
    }

    info!(
        restart_delay_ms = config.deployment.restart_delay_ms,
        "rules-deployment service started"
    );

    shutdown_signal().await;

    info!(snapshot = %manager.debug_snapshot(), "关闭前的部署状态");
    manager.shutdown();
    scheduler.shutdown().await;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
