//! 规则集领域模型
//!
//! 规则集源文本是一个 JSON 文档，包含若干命名规则。每条规则由匹配单个事实的
//! 条件树（`when`）和一组动作（`then`）组成。

use crate::operators::{LogicalOperator, Operator};
use rules_shared::assets::AssetQuery;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 规则集文档
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesetDocument {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// 单条规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    /// 优先级，值越大越先触发
    #[serde(default)]
    pub salience: i32,
    pub when: RuleNode,
    #[serde(default)]
    pub then: Vec<Action>,
}

/// 规则节点（条件或逻辑组）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleNode {
    Condition(Condition),
    Group(LogicalGroup),
}

/// 条件节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// 逻辑组节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalGroup {
    pub operator: LogicalOperator,
    pub children: Vec<RuleNode>,
}

impl LogicalGroup {
    pub fn and(children: Vec<RuleNode>) -> Self {
        Self {
            operator: LogicalOperator::And,
            children,
        }
    }

    pub fn or(children: Vec<RuleNode>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            children,
        }
    }
}

/// 规则动作
///
/// 省略 `entity_id` 时取触发事实的实体，省略 `value` 时取触发事实的值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// 输出一条日志
    Log { message: String },
    /// 向工作内存插入派生事实
    Insert {
        #[serde(default)]
        entity_id: Option<String>,
        attribute: String,
        #[serde(default)]
        value: Option<Value>,
    },
    /// 通过资产门面更新一个属性
    Dispatch {
        #[serde(default)]
        entity_id: Option<String>,
        attribute: String,
        #[serde(default)]
        value: Option<Value>,
    },
    /// 查询资产后逐个更新属性
    DispatchQuery {
        #[serde(default)]
        query: AssetQuery,
        attribute: String,
        #[serde(default)]
        value: Option<Value>,
    },
}

/// 评估上下文 - 事实在条件求值时的 JSON 视图
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    data: Value,
}

impl EvaluationContext {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    /// 获取字段值（支持点号分隔的路径，如 "value.mode" 或 "value.readings.0"）
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.data;

        for part in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}
