//! 规则部署错误类型
//!
//! 编译与会话生命周期错误在部署边界被吸收，作为部署状态保存（因此可克隆），
//! 不会抛给事实写入方。

use rule_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeploymentError {
    /// 作用域内某个规则集编译失败，整个作用域不运行
    #[error("规则编译失败: {0}")]
    Compile(String),

    /// 会话创建、事实回放或首次触发失败
    #[error("会话启动失败: {0}")]
    SessionStart(String),

    /// 运行中的会话发生故障，已被释放，不会自动重启
    #[error("规则执行失败: {0}")]
    RuleExecution(String),

    /// 规则动作在持有部署锁期间试图修改规则集
    #[error("规则动作中不允许修改规则集: {0}")]
    Reentrant(String),

    /// 部署已从管理器中移除
    #[error("规则部署已退役: {0}")]
    Retired(String),
}

pub type Result<T> = std::result::Result<T, DeploymentError>;

impl DeploymentError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compile(_) => "COMPILE_ERROR",
            Self::SessionStart(_) => "SESSION_START_ERROR",
            Self::RuleExecution(_) => "RULE_EXECUTION_ERROR",
            Self::Reentrant(_) => "REENTRANT_OPERATION",
            Self::Retired(_) => "DEPLOYMENT_RETIRED",
        }
    }
}

/// 按引擎错误的性质归类：编译期问题记为 Compile，其余视为会话启动失败
impl From<EngineError> for DeploymentError {
    fn from(err: EngineError) -> Self {
        if err.is_compile_error() {
            Self::Compile(err.to_string())
        } else {
            Self::SessionStart(err.to_string())
        }
    }
}
