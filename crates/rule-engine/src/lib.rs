//! 规则评估引擎
//!
//! 定义规则部署所依赖的引擎契约（编译、会话、事实句柄、会话环境），
//! 并提供一个基于 JSON 规则集的参考实现：
//! - JSON 规则定义和解析
//! - 按作用域整体编译与链接
//! - 带议程和优先级的前向链式触发
//! - 通过受限资产门面执行规则动作

pub mod compiler;
pub mod contract;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod models;
pub mod operators;
pub mod session;

pub use compiler::{CompiledRule, CompiledUnit, RuleCompiler, RuleModule};
pub use contract::{Assets, EngineSession, Fact, FactHandle, RuleEngine, SessionEnvironment};
pub use engine::JsonRuleEngine;
pub use error::{ActionError, EngineError, Result};
pub use models::{
    Action, Condition, EvaluationContext, LogicalGroup, RuleDefinition, RuleNode, RulesetDocument,
};
pub use operators::{LogicalOperator, Operator};
pub use session::JsonSession;
