//! 规则编译器
//!
//! 将 JSON 规则集解析为内存中的执行树（正则预编译），并把同一作用域的
//! 全部规则集链接成一个模块。链接是原子的：任何一个规则集有问题，整个模块失败。

use crate::error::{EngineError, Result};
use crate::models::{Action, Condition, RuleDefinition, RuleNode, RulesetDocument};
use crate::operators::{LogicalOperator, Operator};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// 编译后的条件
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pub pattern: Option<Regex>,
}

/// 编译后的条件树
#[derive(Debug, Clone)]
pub enum CompiledNode {
    Condition(CompiledCondition),
    Group {
        operator: LogicalOperator,
        children: Vec<CompiledNode>,
    },
}

/// 编译后的规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub unit_id: String,
    pub name: String,
    pub salience: i32,
    pub root: CompiledNode,
    pub actions: Vec<Action>,
}

/// 单个规则集的编译产物
///
/// 只保留执行树，不持有源文本。
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    unit_id: String,
    rules: Vec<CompiledRule>,
}

impl CompiledUnit {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }
}

/// 链接后的规则模块，按优先级降序、声明顺序升序排列
#[derive(Debug)]
pub struct RuleModule {
    rules: Vec<Arc<CompiledRule>>,
    /// 编译版本号，用于日志中区分不同的模块
    pub compile_version: u64,
}

impl RuleModule {
    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 规则编译器
pub struct RuleCompiler {
    compile_version: u64,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self { compile_version: 0 }
    }

    /// 编译单个规则集源文本
    pub fn compile_unit(&self, unit_id: &str, source: &str) -> Result<CompiledUnit> {
        let document: RulesetDocument =
            serde_json::from_str(source).map_err(|e| Self::unit_error(unit_id, e.to_string()))?;

        let mut seen = HashMap::new();
        let mut rules = Vec::with_capacity(document.rules.len());

        for (index, rule) in document.rules.into_iter().enumerate() {
            if let Some(previous) = seen.insert(rule.name.clone(), index) {
                return Err(Self::unit_error(
                    unit_id,
                    format!("规则名称 '{}' 重复（第 {} 和第 {} 条）", rule.name, previous, index),
                ));
            }
            rules.push(self.compile_rule(unit_id, rule)?);
        }

        Ok(CompiledUnit {
            unit_id: unit_id.to_string(),
            rules,
        })
    }

    /// 将一个作用域的全部规则集链接为一个模块
    pub fn link(&mut self, units: &[&CompiledUnit]) -> Result<RuleModule> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        let mut rules = Vec::new();

        for unit in units {
            for rule in &unit.rules {
                if let Some(owner) = owners.insert(rule.name.as_str(), unit.unit_id.as_str()) {
                    return Err(EngineError::Link(format!(
                        "规则 '{}' 同时定义在规则集 '{}' 和 '{}' 中",
                        rule.name, owner, unit.unit_id
                    )));
                }
                rules.push(Arc::new(rule.clone()));
            }
        }

        // sort_by 是稳定排序，同优先级保持声明顺序
        rules.sort_by(|a, b| b.salience.cmp(&a.salience));

        self.compile_version += 1;

        Ok(RuleModule {
            rules,
            compile_version: self.compile_version,
        })
    }

    fn compile_rule(&self, unit_id: &str, rule: RuleDefinition) -> Result<CompiledRule> {
        if rule.name.trim().is_empty() {
            return Err(Self::unit_error(unit_id, "规则名称不能为空".to_string()));
        }

        let path = format!("{}.when", rule.name);
        let root = self
            .compile_node(&rule.when, &path)
            .map_err(|message| Self::unit_error(unit_id, message))?;

        for (i, action) in rule.then.iter().enumerate() {
            Self::validate_action(action)
                .map_err(|message| Self::unit_error(unit_id, format!("{}.then[{}]: {}", rule.name, i, message)))?;
        }

        Ok(CompiledRule {
            unit_id: unit_id.to_string(),
            name: rule.name,
            salience: rule.salience,
            root,
            actions: rule.then,
        })
    }

    fn compile_node(&self, node: &RuleNode, path: &str) -> std::result::Result<CompiledNode, String> {
        match node {
            RuleNode::Condition(cond) => Ok(CompiledNode::Condition(Self::compile_condition(cond, path)?)),
            RuleNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(format!("逻辑组 '{}' 不能为空", path));
                }

                let children = group
                    .children
                    .iter()
                    .enumerate()
                    .map(|(i, child)| self.compile_node(child, &format!("{}.children[{}]", path, i)))
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                Ok(CompiledNode::Group {
                    operator: group.operator,
                    children,
                })
            }
        }
    }

    fn compile_condition(cond: &Condition, path: &str) -> std::result::Result<CompiledCondition, String> {
        if cond.field.is_empty() {
            return Err(format!("条件 '{}' 的字段不能为空", path));
        }

        if cond.operator.expects_array() && !cond.value.is_array() {
            return Err(format!("条件 '{}' 的 {} 操作符需要数组值", path, cond.operator));
        }

        if cond.operator == Operator::Between && cond.value.as_array().map_or(0, Vec::len) != 2 {
            return Err(format!("条件 '{}' 的 between 操作符需要 [min, max] 数组", path));
        }

        let pattern = if cond.operator == Operator::Regex {
            let source = cond
                .value
                .as_str()
                .ok_or_else(|| format!("条件 '{}' 的 regex 操作符需要字符串值", path))?;
            Some(Regex::new(source).map_err(|e| format!("条件 '{}' 的正则表达式无效: {}", path, e))?)
        } else {
            None
        };

        Ok(CompiledCondition {
            field: cond.field.clone(),
            operator: cond.operator,
            // 空值检查不看期望值
            value: if cond.operator.is_unary() {
                Value::Null
            } else {
                cond.value.clone()
            },
            pattern,
        })
    }

    fn validate_action(action: &Action) -> std::result::Result<(), String> {
        match action {
            Action::Log { message } if message.is_empty() => Err("日志内容不能为空".to_string()),
            Action::Insert { attribute, .. }
            | Action::Dispatch { attribute, .. }
            | Action::DispatchQuery { attribute, .. }
                if attribute.is_empty() =>
            {
                Err("属性名不能为空".to_string())
            }
            _ => Ok(()),
        }
    }

    fn unit_error(unit_id: &str, message: String) -> EngineError {
        EngineError::Compile {
            unit_id: unit_id.to_string(),
            message,
        }
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruleset(rules: &str) -> String {
        format!(r#"{{ "rules": [{}] }}"#, rules)
    }

    const HOT: &str = r#"{
        "name": "too_hot",
        "salience": 5,
        "when": { "type": "condition", "field": "value", "operator": "gt", "value": 30 },
        "then": [{ "type": "log", "message": "hot" }]
    }"#;

    const COLD: &str = r#"{
        "name": "too_cold",
        "when": { "type": "condition", "field": "value", "operator": "lt", "value": 10 }
    }"#;

    #[test]
    fn test_compile_unit() {
        let compiler = RuleCompiler::new();
        let unit = compiler.compile_unit("climate", &ruleset(&format!("{},{}", HOT, COLD))).unwrap();

        assert_eq!(unit.unit_id(), "climate");
        assert_eq!(unit.rules().len(), 2);
        assert_eq!(unit.rules()[0].name, "too_hot");
        assert!(unit.rules()[1].actions.is_empty());
    }

    #[test]
    fn test_invalid_json_is_compile_error() {
        let compiler = RuleCompiler::new();
        let err = compiler.compile_unit("broken", "{ not json").unwrap_err();
        assert!(matches!(err, EngineError::Compile { ref unit_id, .. } if unit_id == "broken"));
    }

    #[test]
    fn test_duplicate_rule_in_unit() {
        let compiler = RuleCompiler::new();
        let err = compiler.compile_unit("dup", &ruleset(&format!("{},{}", HOT, HOT))).unwrap_err();
        assert!(err.to_string().contains("重复"));
    }

    #[test]
    fn test_validate_empty_group() {
        let compiler = RuleCompiler::new();
        let source = ruleset(
            r#"{ "name": "empty", "when": { "type": "group", "operator": "AND", "children": [] } }"#,
        );
        let err = compiler.compile_unit("r1", &source).unwrap_err();
        assert!(err.to_string().contains("不能为空"));
    }

    #[test]
    fn test_validate_invalid_regex() {
        let compiler = RuleCompiler::new();
        let source = ruleset(
            r#"{ "name": "re", "when": { "type": "condition", "field": "entity_id", "operator": "regex", "value": "[invalid" } }"#,
        );
        let err = compiler.compile_unit("r1", &source).unwrap_err();
        assert!(err.to_string().contains("正则表达式无效"));
    }

    #[test]
    fn test_validate_between_requires_pair() {
        let compiler = RuleCompiler::new();
        let source = ruleset(
            r#"{ "name": "range", "when": { "type": "condition", "field": "value", "operator": "between", "value": [1, 2, 3] } }"#,
        );
        assert!(compiler.compile_unit("r1", &source).is_err());
    }

    #[test]
    fn test_link_orders_by_salience_and_rejects_duplicates() {
        let mut compiler = RuleCompiler::new();
        let cold = compiler.compile_unit("cold", &ruleset(COLD)).unwrap();
        let hot = compiler.compile_unit("hot", &ruleset(HOT)).unwrap();

        let module = compiler.link(&[&cold, &hot]).unwrap();
        assert_eq!(module.len(), 2);
        assert_eq!(module.rules()[0].name, "too_hot");
        assert_eq!(module.compile_version, 1);

        let hot_again = compiler.compile_unit("hot-copy", &ruleset(HOT)).unwrap();
        let err = compiler.link(&[&hot, &hot_again]).unwrap_err();
        assert!(matches!(err, EngineError::Link(_)));
    }

    #[test]
    fn test_empty_ruleset_links_to_empty_module() {
        let mut compiler = RuleCompiler::new();
        let unit = compiler.compile_unit("empty", r#"{ "rules": [] }"#).unwrap();
        let module = compiler.link(&[&unit]).unwrap();
        assert!(module.is_empty());
    }
}
