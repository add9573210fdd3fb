//! 规则部署领域模型
//!
//! 规则集单元、部署状态、作用域与诊断快照。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 规则集部署状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    /// 有效但当前未运行（同作用域有其他规则集失败）
    Ready,
    /// 已随作用域模块编译成功
    Deployed,
    /// 编译失败
    Failed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "READY",
            Self::Deployed => "DEPLOYED",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// 规则集单元
///
/// 源文本只在编译前持有，编译（无论成败）后即被取走丢弃；
/// 幂等判断依赖版本号和源文本指纹。
#[derive(Debug, Clone)]
pub struct RuleUnit {
    pub id: String,
    pub version: u64,
    pub status: UnitStatus,
    source: Option<String>,
    fingerprint: String,
}

impl RuleUnit {
    pub fn new(id: impl Into<String>, version: u64, source: impl Into<String>) -> Self {
        let source = source.into();
        let fingerprint = Self::hash_source(&source);

        Self {
            id: id.into(),
            version,
            status: UnitStatus::Ready,
            source: Some(source),
            fingerprint,
        }
    }

    fn hash_source(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// 源文本是否为空白（空白规则集视为无规则）
    pub fn is_blank(&self) -> bool {
        self.source.as_deref().is_none_or(|s| s.trim().is_empty())
    }

    /// 取走源文本，之后单元不再持有它
    pub fn take_source(&mut self) -> Option<String> {
        self.source.take()
    }

    #[cfg(test)]
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// 版本和内容都相同视为重复提交
    pub fn same_content(&self, other: &RuleUnit) -> bool {
        self.version == other.version && self.fingerprint == other.fingerprint
    }
}

/// 规则部署作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    /// 租户 ID
    Tenant(String),
    /// 资产子树的根实体 ID
    Asset(String),
}

impl Scope {
    pub fn tenant(id: impl Into<String>) -> Self {
        Self::Tenant(id.into())
    }

    pub fn asset(id: impl Into<String>) -> Self {
        Self::Asset(id.into())
    }

    /// 用于日志和指标标签，如 `tenant:acme`
    pub fn label(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Tenant(id) => format!("tenant:{}", id),
            Self::Asset(id) => format!("asset:{}", id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 部署所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentPhase {
    /// 没有规则集
    Empty,
    /// 已编译，等待延迟重启
    PendingStart,
    Running,
    /// 已编译但未运行，也没有待执行的重启
    Stopped,
    /// 编译失败或会话故障
    Error,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Empty => "EMPTY",
            Self::PendingStart => "PENDING_START",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// 单元快照
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub id: String,
    pub version: u64,
    pub status: UnitStatus,
}

/// 部署诊断快照，供运维查看，不用于机器解析
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSnapshot {
    pub scope: String,
    pub phase: DeploymentPhase,
    pub running: bool,
    pub error: Option<String>,
    pub restart_pending: bool,
    pub buffered_facts: usize,
    pub session_facts: Option<usize>,
    pub starts: u64,
    pub stops: u64,
    pub fired: u64,
    pub units: Vec<UnitSnapshot>,
}

impl fmt::Display for DeploymentSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RuleDeployment[{}] {}", self.scope, self.phase)?;
        writeln!(
            f,
            "  running={} restart_pending={} error={}",
            self.running,
            self.restart_pending,
            self.error.as_deref().unwrap_or("-")
        )?;
        writeln!(
            f,
            "  facts buffered={} session={} starts={} stops={} fired={}",
            self.buffered_facts,
            self.session_facts
                .map_or_else(|| "-".to_string(), |n| n.to_string()),
            self.starts,
            self.stops,
            self.fired
        )?;
        for unit in &self.units {
            writeln!(f, "  {} v{}: {}", unit.id, unit.version, unit.status)?;
        }
        Ok(())
    }
}
