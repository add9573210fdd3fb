//! JSON 规则引擎
//!
//! [`RuleEngine`] 的参考实现：规则集为 JSON 文档，模块为按优先级排序的规则列表。

use crate::compiler::{CompiledUnit, RuleCompiler, RuleModule};
use crate::contract::{RuleEngine, SessionEnvironment};
use crate::error::Result;
use crate::session::JsonSession;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct JsonRuleEngine {
    compiler: Mutex<RuleCompiler>,
}

impl JsonRuleEngine {
    pub fn new() -> Self {
        Self {
            compiler: Mutex::new(RuleCompiler::new()),
        }
    }
}

impl Default for JsonRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine for JsonRuleEngine {
    type Unit = CompiledUnit;
    type Module = RuleModule;
    type Session = JsonSession;

    fn compile_unit(&self, unit_id: &str, source: &str) -> Result<CompiledUnit> {
        let unit = self.compiler.lock().compile_unit(unit_id, source)?;
        debug!(unit_id, rules = unit.rules().len(), "规则集编译完成");
        Ok(unit)
    }

    fn build(&self, units: &[&CompiledUnit]) -> Result<RuleModule> {
        let module = self.compiler.lock().link(units)?;
        info!(
            units = units.len(),
            rules = module.len(),
            version = module.compile_version,
            "规则模块构建完成"
        );
        Ok(module)
    }

    fn new_session(&self, module: Arc<RuleModule>, env: SessionEnvironment) -> Result<JsonSession> {
        debug!(scope = %env.scope, version = module.compile_version, "创建评估会话");
        Ok(JsonSession::new(module, env))
    }
}
