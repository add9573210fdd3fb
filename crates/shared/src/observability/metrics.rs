//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_metric_descriptions(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_metric_descriptions(service_name: &str) {
    metrics::describe_counter!(
        "rules_deployment_starts_total",
        "Number of evaluation sessions started per scope"
    );
    metrics::describe_counter!(
        "rules_deployment_stops_total",
        "Number of evaluation sessions stopped per scope"
    );
    metrics::describe_counter!(
        "rules_compile_failures_total",
        "Number of scope compilations that failed"
    );
    metrics::describe_counter!("rules_fired_total", "Number of rule activations fired");
    metrics::describe_counter!(
        "rules_session_errors_total",
        "Number of sessions disposed because of a fault"
    );
    metrics::describe_counter!(
        "rules_scope_rejections_total",
        "Number of rule actions rejected for exceeding their scope"
    );
    metrics::describe_gauge!(
        "rules_session_fact_count",
        "Facts held in working memory per scope"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 规则部署指标
// ============================================================================

#[inline]
pub fn record_session_start(scope: &str) {
    metrics::counter!("rules_deployment_starts_total", "scope" => scope.to_string()).increment(1);
}

#[inline]
pub fn record_session_stop(scope: &str) {
    metrics::counter!("rules_deployment_stops_total", "scope" => scope.to_string()).increment(1);
}

#[inline]
pub fn record_compile_failure(scope: &str) {
    metrics::counter!("rules_compile_failures_total", "scope" => scope.to_string()).increment(1);
}

#[inline]
pub fn record_rules_fired(scope: &str, count: usize) {
    metrics::counter!("rules_fired_total", "scope" => scope.to_string()).increment(count as u64);
}

/// 记录会话故障，`kind` 区分启动失败与运行期故障
#[inline]
pub fn record_session_error(scope: &str, kind: &str) {
    metrics::counter!(
        "rules_session_errors_total",
        "scope" => scope.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_scope_rejection(scope: &str) {
    metrics::counter!("rules_scope_rejections_total", "scope" => scope.to_string()).increment(1);
}

#[inline]
pub fn set_session_fact_count(scope: &str, count: usize) {
    metrics::gauge!("rules_session_fact_count", "scope" => scope.to_string()).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 未安装 recorder 时 metrics 宏为空操作
        record_session_start("global");
        record_session_stop("global");
        record_compile_failure("tenant:acme");
        record_rules_fired("tenant:acme", 3);
        record_session_error("asset:room", "rule_execution");
        record_scope_rejection("asset:room");
        set_session_fact_count("global", 42);
    }
}
