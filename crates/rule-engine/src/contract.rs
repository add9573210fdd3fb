//! 引擎契约
//!
//! 规则部署只通过这里的 trait 与具体引擎交互：编译单个规则集、把一个作用域的
//! 规则集整体构建为模块、在模块上创建会话。会话通过 [`SessionEnvironment`]
//! 获得作用域受限的资产门面，不依赖任何全局状态。

use crate::error::{ActionError, Result};
use crate::models::EvaluationContext;
use chrono::{DateTime, Utc};
use rules_shared::assets::AssetQuery;
use rules_shared::events::{AttributeEvent, AttributeRef};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// 事实句柄
///
/// 会话为每个插入的事实分配一个不透明句柄，撤回时凭句柄定位。
/// 句柄只在分配它的会话内有效。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactHandle(u64);

impl FactHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 属性事实：一个属性引用在某个时间点的值
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub identity: AttributeRef,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl Fact {
    pub fn new(identity: AttributeRef, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            identity,
            value,
            timestamp,
        }
    }

    /// 条件求值时看到的 JSON 视图
    pub fn to_context(&self) -> EvaluationContext {
        EvaluationContext::new(json!({
            "entity_id": self.identity.entity_id,
            "attribute": self.identity.attribute_name,
            "value": self.value,
            "timestamp": self.timestamp.to_rfc3339(),
        }))
    }

    /// 值和时间戳都相同视为同一次更新
    pub fn same_update(&self, other: &Fact) -> bool {
        self.value == other.value && self.timestamp == other.timestamp
    }
}

impl From<AttributeEvent> for Fact {
    fn from(event: AttributeEvent) -> Self {
        Self {
            identity: AttributeRef::new(event.entity_id, event.attribute_name),
            value: event.value,
            timestamp: event.timestamp,
        }
    }
}

/// 规则动作可见的资产能力
///
/// 实现方负责把查询和写入限制在部署作用域内。
#[cfg_attr(test, mockall::automock)]
pub trait Assets: Send + Sync {
    /// 查询资产，返回实体 ID 列表
    fn query(&self, query: AssetQuery) -> std::result::Result<Vec<String>, ActionError>;

    /// 更新一个属性
    fn dispatch(&self, event: AttributeEvent) -> std::result::Result<(), ActionError>;
}

/// 会话环境
///
/// 每个会话启动时注入，替代全局变量：作用域标签、受限资产门面、日志 span。
#[derive(Clone)]
pub struct SessionEnvironment {
    pub scope: String,
    pub assets: Arc<dyn Assets>,
    pub span: tracing::Span,
}

impl SessionEnvironment {
    pub fn new(scope: impl Into<String>, assets: Arc<dyn Assets>) -> Self {
        let scope = scope.into();
        let span = tracing::info_span!("rules", scope = %scope);
        Self {
            scope,
            assets,
            span,
        }
    }
}

impl fmt::Debug for SessionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEnvironment")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// 评估会话
///
/// 会话只在持有方的锁内使用，因此只要求 `Send`。
pub trait EngineSession: Send {
    /// 插入事实并计算新激活的规则，返回句柄
    fn insert(&mut self, fact: &Fact) -> Result<FactHandle>;

    /// 撤回事实，同时移除其尚未触发的激活
    fn retract(&mut self, handle: FactHandle) -> Result<()>;

    /// 触发议程直到为空或会话被停止，返回触发次数
    ///
    /// `suppressed` 中句柄的激活被消费但不执行动作。
    fn fire_all(&mut self, suppressed: &HashSet<FactHandle>) -> Result<usize>;

    /// 当前工作内存中的事实数（含派生事实）
    fn fact_count(&self) -> usize;

    /// 请求停止触发循环
    fn halt(&mut self);

    /// 释放会话，之后的调用返回 `SessionDisposed`
    fn dispose(&mut self);
}

/// 规则引擎
pub trait RuleEngine: Send + Sync + 'static {
    /// 单个规则集的编译产物
    type Unit: Send + Sync + 'static;
    /// 一个作用域全部规则集链接后的模块
    type Module: Send + Sync + 'static;
    type Session: EngineSession + 'static;

    /// 编译单个规则集，源文本在返回后不再需要
    fn compile_unit(&self, unit_id: &str, source: &str) -> Result<Self::Unit>;

    /// 将规则集整体构建为模块，任一规则集冲突则整体失败
    fn build(&self, units: &[&Self::Unit]) -> Result<Self::Module>;

    /// 在模块上创建新会话
    fn new_session(
        &self,
        module: Arc<Self::Module>,
        env: SessionEnvironment,
    ) -> Result<Self::Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_from_event() {
        let event = AttributeEvent::new("room-1", "temperature", 21);
        let ts = event.timestamp;
        let fact = Fact::from(event);

        assert_eq!(fact.identity, AttributeRef::new("room-1", "temperature"));
        assert_eq!(fact.timestamp, ts);

        let ctx = fact.to_context();
        assert_eq!(ctx.get_field("attribute"), Some(&json!("temperature")));
        assert_eq!(ctx.get_field("value"), Some(&json!(21)));
    }

    #[test]
    fn test_same_update() {
        let fact: Fact = AttributeEvent::new("room-1", "temperature", 21).into();
        let mut other = fact.clone();
        assert!(fact.same_update(&other));

        other.value = json!(22);
        assert!(!fact.same_update(&other));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(FactHandle::new(7).to_string(), "#7");
        assert!(FactHandle::new(1) < FactHandle::new(2));
    }
}
