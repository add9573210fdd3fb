//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("规则解析失败: {0}")]
    Parse(String),

    #[error("规则集 {unit_id} 编译失败: {message}")]
    Compile { unit_id: String, message: String },

    #[error("规则集链接失败: {0}")]
    Link(String),

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("规则执行失败: {0}")]
    Execution(String),

    #[error("事实句柄不存在: {0}")]
    UnknownHandle(u64),

    #[error("会话已释放")]
    SessionDisposed,

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// 是否为编译期错误（规则集本身有问题，而非运行期故障）
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Compile { .. } | Self::Link(_) | Self::Json(_)
        )
    }
}

/// 规则动作通过资产门面执行时的错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// 动作试图越过部署作用域，仅拒绝本次调用，会话继续运行
    #[error("超出规则作用域: {0}")]
    ScopeAuthorization(String),

    #[error("作用域已不可用: {0}")]
    ScopeUnavailable(String),

    #[error("协作服务错误: {0}")]
    Collaborator(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
