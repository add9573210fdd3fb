//! 事实写入性能基准测试
//!
//! 测试覆盖：
//! - 会话未运行时的缓冲写入
//! - 不同规则数量下，运行中部署的写入并触发

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rule_engine::{Fact, JsonRuleEngine};
use rules_deployment::{
    AttributePipeline, DeploymentContext, FactStore, InMemoryAssetStore, ManualScheduler,
    RestartScheduler, RuleDeployment, RuleUnit, Scope,
};
use rules_shared::assets::EntityRecord;
use rules_shared::events::AttributeEvent;
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

/// 生成包含 `count` 条阈值规则的规则集
fn create_ruleset(count: usize) -> String {
    let rules: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "name": format!("threshold_{}", i),
                "when": {
                    "type": "group",
                    "operator": "AND",
                    "children": [
                        { "type": "condition", "field": "attribute", "operator": "eq", "value": "temperature" },
                        { "type": "condition", "field": "value", "operator": "gt", "value": 1000 + i }
                    ]
                },
                "then": [{ "type": "log", "message": "{entity_id} over threshold" }]
            })
        })
        .collect();
    json!({ "rules": rules }).to_string()
}

fn running_deployment(rule_count: usize) -> Arc<RuleDeployment<JsonRuleEngine>> {
    let store = Arc::new(InMemoryAssetStore::with_entities((0..100).map(|i| {
        EntityRecord::new(format!("sensor-{}", i), "Sensor", "acme", None)
    })));
    let scheduler = Arc::new(ManualScheduler::new());
    let ctx = DeploymentContext {
        engine: Arc::new(JsonRuleEngine::new()),
        store: store.clone(),
        processor: Arc::new(AttributePipeline::new(store)),
        restart: RestartScheduler::new(scheduler.clone(), Duration::from_secs(1)),
        fact_count_warn_delta: None,
    };

    let deployment = RuleDeployment::new(Scope::tenant("acme"), &ctx);
    deployment
        .insert_ruleset(RuleUnit::new("bench", 1, create_ruleset(rule_count)))
        .unwrap();
    scheduler.advance(Duration::from_secs(1));
    assert!(deployment.is_running());
    deployment
}

/// 缓冲写入基准（不同事实身份数量）
fn bench_buffered_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffered_upsert");

    for identities in [10usize, 100, 1000].iter() {
        let facts: Vec<Fact> = (0..*identities)
            .map(|i| AttributeEvent::new(format!("sensor-{}", i), "temperature", i).into())
            .collect();

        group.throughput(Throughput::Elements(*identities as u64));
        group.bench_with_input(BenchmarkId::from_parameter(identities), identities, |b, _| {
            b.iter(|| {
                let mut store = FactStore::new();
                for fact in &facts {
                    let _ = store.upsert(black_box(fact.clone()), None);
                }
                black_box(store.len())
            })
        });
    }

    group.finish();
}

/// 运行中部署的写入并触发基准（不同规则数量）
fn bench_running_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("running_upsert");

    for rule_count in [1usize, 10, 50].iter() {
        let deployment = running_deployment(*rule_count);
        let mut value = 0u64;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(rule_count), rule_count, |b, _| {
            b.iter(|| {
                value += 1;
                let entity = format!("sensor-{}", value % 100);
                deployment.upsert_fact(black_box(AttributeEvent::new(entity, "temperature", value)));
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_buffered_upsert, bench_running_upsert);

criterion_main!(benches);
