//! JSON 规则会话
//!
//! 工作内存 + 议程。插入事实时对模块中的每条规则求值，匹配的规则进入议程；
//! `fire_all` 按优先级降序、激活顺序升序依次执行动作。`insert` 动作产生的
//! 派生事实会再次进入求值，形成前向链。

use crate::compiler::{CompiledNode, CompiledRule, RuleModule};
use crate::contract::{EngineSession, Fact, FactHandle, SessionEnvironment};
use crate::error::{ActionError, EngineError, Result};
use crate::evaluator::ConditionEvaluator;
use crate::models::{Action, EvaluationContext};
use crate::operators::LogicalOperator;
use chrono::Utc;
use rules_shared::events::{AttributeEvent, AttributeRef};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 议程中的一次激活
#[derive(Debug, Clone)]
struct Activation {
    rule: Arc<CompiledRule>,
    handle: FactHandle,
}

/// 议程排序键：优先级降序，其次激活序号升序
type AgendaKey = (Reverse<i32>, u64);

pub struct JsonSession {
    module: Arc<RuleModule>,
    env: SessionEnvironment,
    facts: BTreeMap<FactHandle, Fact>,
    agenda: BTreeMap<AgendaKey, Activation>,
    next_handle: u64,
    next_seq: u64,
    halted: bool,
    disposed: bool,
}

impl JsonSession {
    pub fn new(module: Arc<RuleModule>, env: SessionEnvironment) -> Self {
        Self {
            module,
            env,
            facts: BTreeMap::new(),
            agenda: BTreeMap::new(),
            next_handle: 1,
            next_seq: 0,
            halted: false,
            disposed: false,
        }
    }

    pub fn scope(&self) -> &str {
        &self.env.scope
    }

    /// 议程中尚未触发的激活数
    pub fn agenda_len(&self) -> usize {
        self.agenda.len()
    }

    pub fn get(&self, handle: FactHandle) -> Option<&Fact> {
        self.facts.get(&handle)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(EngineError::SessionDisposed)
        } else {
            Ok(())
        }
    }

    fn evaluate_node(node: &CompiledNode, ctx: &EvaluationContext) -> Result<bool> {
        match node {
            CompiledNode::Condition(cond) => ConditionEvaluator::evaluate(
                ctx.get_field(&cond.field),
                cond.operator,
                &cond.value,
                cond.pattern.as_ref(),
            ),
            CompiledNode::Group { operator, children } => match operator {
                LogicalOperator::And => {
                    for child in children {
                        if !Self::evaluate_node(child, ctx)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                LogicalOperator::Or => {
                    for child in children {
                        if Self::evaluate_node(child, ctx)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
        }
    }

    fn execute(&mut self, rule: &CompiledRule, trigger: &Fact) -> Result<()> {
        for action in &rule.actions {
            match action {
                Action::Log { message } => {
                    info!(
                        rule = %rule.name,
                        unit = %rule.unit_id,
                        fact = %trigger.identity,
                        "{}",
                        Self::render(message, trigger)
                    );
                }
                Action::Insert {
                    entity_id,
                    attribute,
                    value,
                } => {
                    let derived = Fact::new(
                        AttributeRef::new(
                            entity_id.clone().unwrap_or_else(|| trigger.identity.entity_id.clone()),
                            attribute.clone(),
                        ),
                        value.clone().unwrap_or_else(|| trigger.value.clone()),
                        Utc::now(),
                    );
                    let handle = self.insert(&derived)?;
                    debug!(rule = %rule.name, %handle, fact = %derived.identity, "插入派生事实");
                }
                Action::Dispatch {
                    entity_id,
                    attribute,
                    value,
                } => {
                    let event = AttributeEvent::new(
                        entity_id.clone().unwrap_or_else(|| trigger.identity.entity_id.clone()),
                        attribute.clone(),
                        value.clone().unwrap_or_else(|| trigger.value.clone()),
                    );
                    let result = self.env.assets.dispatch(event);
                    Self::tolerate(rule, result)?;
                }
                Action::DispatchQuery {
                    query,
                    attribute,
                    value,
                } => {
                    let ids = match self.env.assets.query(query.clone()) {
                        Ok(ids) => ids,
                        Err(e) => {
                            Self::tolerate(rule, Err(e))?;
                            continue;
                        }
                    };
                    let value = value.clone().unwrap_or_else(|| trigger.value.clone());
                    for id in ids {
                        let event = AttributeEvent::new(id, attribute.clone(), value.clone());
                        let result = self.env.assets.dispatch(event);
                        Self::tolerate(rule, result)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// 越权只拒绝本次调用，其余错误视为执行故障
    fn tolerate(rule: &CompiledRule, result: std::result::Result<(), ActionError>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(ActionError::ScopeAuthorization(reason)) => {
                warn!(rule = %rule.name, %reason, "规则动作超出作用域，已拒绝");
                Ok(())
            }
            Err(e) => Err(EngineError::Execution(format!(
                "规则 {} 动作失败: {}",
                rule.name, e
            ))),
        }
    }

    /// 日志模板支持 {entity_id}、{attribute}、{value} 占位符
    fn render(message: &str, fact: &Fact) -> String {
        let value = match &fact.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        message
            .replace("{entity_id}", &fact.identity.entity_id)
            .replace("{attribute}", &fact.identity.attribute_name)
            .replace("{value}", &value)
    }
}

impl EngineSession for JsonSession {
    fn insert(&mut self, fact: &Fact) -> Result<FactHandle> {
        self.ensure_live()?;

        let ctx = fact.to_context();
        let mut matched = Vec::new();
        for rule in self.module.rules() {
            if Self::evaluate_node(&rule.root, &ctx)? {
                matched.push(Arc::clone(rule));
            }
        }

        let handle = FactHandle::new(self.next_handle);
        self.next_handle += 1;
        self.facts.insert(handle, fact.clone());

        for rule in matched {
            let key = (Reverse(rule.salience), self.next_seq);
            self.next_seq += 1;
            self.agenda.insert(key, Activation { rule, handle });
        }

        Ok(handle)
    }

    fn retract(&mut self, handle: FactHandle) -> Result<()> {
        self.ensure_live()?;

        if self.facts.remove(&handle).is_none() {
            return Err(EngineError::UnknownHandle(handle.id()));
        }
        self.agenda.retain(|_, activation| activation.handle != handle);

        Ok(())
    }

    fn fire_all(&mut self, suppressed: &HashSet<FactHandle>) -> Result<usize> {
        self.ensure_live()?;

        let span = self.env.span.clone();
        let _entered = span.enter();

        let mut fired = 0;
        while !self.halted {
            let Some((_, activation)) = self.agenda.pop_first() else {
                break;
            };

            if suppressed.contains(&activation.handle) {
                continue;
            }

            let Some(trigger) = self.facts.get(&activation.handle).cloned() else {
                continue;
            };

            self.execute(&activation.rule, &trigger)?;
            fired += 1;
        }

        self.halted = false;
        Ok(fired)
    }

    fn fact_count(&self) -> usize {
        self.facts.len()
    }

    fn halt(&mut self) {
        self.halted = true;
    }

    fn dispose(&mut self) {
        self.facts.clear();
        self.agenda.clear();
        self.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::contract::MockAssets;
    use serde_json::json;

    const CLIMATE: &str = r#"{
        "rules": [
            {
                "name": "too_hot",
                "salience": 10,
                "when": {
                    "type": "group",
                    "operator": "AND",
                    "children": [
                        { "type": "condition", "field": "attribute", "operator": "eq", "value": "temperature" },
                        { "type": "condition", "field": "value", "operator": "gt", "value": 30 }
                    ]
                },
                "then": [
                    { "type": "log", "message": "{entity_id} is {value}" },
                    { "type": "dispatch", "attribute": "fan", "value": true }
                ]
            },
            {
                "name": "record",
                "when": { "type": "condition", "field": "attribute", "operator": "eq", "value": "temperature" },
                "then": [{ "type": "insert", "attribute": "seen", "value": true }]
            }
        ]
    }"#;

    fn session(source: &str, assets: MockAssets) -> JsonSession {
        let mut compiler = RuleCompiler::new();
        let unit = compiler.compile_unit("climate", source).unwrap();
        let module = Arc::new(compiler.link(&[&unit]).unwrap());
        JsonSession::new(module, SessionEnvironment::new("global", Arc::new(assets)))
    }

    fn fact(entity: &str, attribute: &str, value: Value) -> Fact {
        AttributeEvent::new(entity, attribute, value).into()
    }

    #[test]
    fn test_fire_in_salience_order_and_forward_chain() {
        let mut assets = MockAssets::new();
        assets
            .expect_dispatch()
            .withf(|e| e.entity_id == "room-1" && e.attribute_name == "fan")
            .times(1)
            .returning(|_| Ok(()));

        let mut session = session(CLIMATE, assets);
        session.insert(&fact("room-1", "temperature", json!(35))).unwrap();
        assert_eq!(session.agenda_len(), 2);

        let fired = session.fire_all(&HashSet::new()).unwrap();
        assert_eq!(fired, 2);
        // 原事实 + 派生的 seen 事实
        assert_eq!(session.fact_count(), 2);
    }

    #[test]
    fn test_suppressed_activations_are_consumed() {
        let mut assets = MockAssets::new();
        assets.expect_dispatch().never();

        let mut session = session(CLIMATE, assets);
        let handle = session.insert(&fact("room-1", "temperature", json!(35))).unwrap();

        let fired = session.fire_all(&HashSet::from([handle])).unwrap();
        assert_eq!(fired, 0);
        assert_eq!(session.agenda_len(), 0);
        assert_eq!(session.fact_count(), 1);
    }

    #[test]
    fn test_retract_removes_pending_activations() {
        let mut session = session(CLIMATE, MockAssets::new());
        let handle = session.insert(&fact("room-1", "temperature", json!(35))).unwrap();

        session.retract(handle).unwrap();
        assert_eq!(session.agenda_len(), 0);
        assert_eq!(session.fire_all(&HashSet::new()).unwrap(), 0);

        let err = session.retract(handle).unwrap_err();
        assert!(matches!(err, EngineError::UnknownHandle(id) if id == handle.id()));
    }

    #[test]
    fn test_scope_rejection_does_not_stop_firing() {
        let mut assets = MockAssets::new();
        assets
            .expect_dispatch()
            .returning(|_| Err(ActionError::ScopeAuthorization("room-1".to_string())));

        let mut session = session(CLIMATE, assets);
        session.insert(&fact("room-1", "temperature", json!(35))).unwrap();
        assert_eq!(session.fire_all(&HashSet::new()).unwrap(), 2);
    }

    #[test]
    fn test_collaborator_failure_is_execution_error() {
        let mut assets = MockAssets::new();
        assets
            .expect_dispatch()
            .returning(|_| Err(ActionError::Collaborator("down".to_string())));

        let mut session = session(CLIMATE, assets);
        session.insert(&fact("room-1", "temperature", json!(35))).unwrap();
        let err = session.fire_all(&HashSet::new()).unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn test_type_mismatch_fails_insert() {
        let mut session = session(CLIMATE, MockAssets::new());
        let err = session
            .insert(&fact("room-1", "temperature", json!("warm")))
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
        assert_eq!(session.fact_count(), 0);
    }

    #[test]
    fn test_dispatch_query_targets_each_result() {
        let source = r#"{
            "rules": [{
                "name": "alarm_all",
                "when": { "type": "condition", "field": "attribute", "operator": "eq", "value": "smoke" },
                "then": [{ "type": "dispatch_query", "query": { "attribute": "alarm" }, "attribute": "alarm", "value": "on" }]
            }]
        }"#;

        let mut assets = MockAssets::new();
        assets
            .expect_query()
            .times(1)
            .returning(|_| Ok(vec!["a".to_string(), "b".to_string()]));
        assets
            .expect_dispatch()
            .withf(|e| e.value == json!("on"))
            .times(2)
            .returning(|_| Ok(()));

        let mut session = session(source, assets);
        session.insert(&fact("room-1", "smoke", json!(true))).unwrap();
        assert_eq!(session.fire_all(&HashSet::new()).unwrap(), 1);
    }

    #[test]
    fn test_disposed_session_rejects_calls() {
        let mut session = session(CLIMATE, MockAssets::new());
        session.insert(&fact("room-1", "humidity", json!(40))).unwrap();
        session.dispose();

        assert_eq!(session.fact_count(), 0);
        assert!(matches!(
            session.insert(&fact("room-1", "humidity", json!(41))),
            Err(EngineError::SessionDisposed)
        ));
    }

    #[test]
    fn test_render_message() {
        let f = fact("room-1", "mode", json!("cool"));
        assert_eq!(JsonSession::render("{entity_id}/{attribute}={value}", &f), "room-1/mode=cool");
    }
}
