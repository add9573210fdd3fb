//! 按作用域部署规则集
//!
//! 每个作用域（全局、租户、资产子树）一个规则部署：
//! - 规则集增量编译，编译失败隔离在本作用域
//! - 规则集变更后延迟重启评估会话，窗口内的变更合并为一次重启
//! - 会话未运行期间缓冲属性事实，启动时静默回放
//! - 规则动作只能通过受限资产门面读写本作用域内的资产

pub mod deployment;
pub mod error;
pub mod facade;
pub mod facts;
pub mod loader;
pub mod manager;
pub mod memory;
pub mod models;
pub mod scheduler;
pub mod session;

pub use deployment::{DeploymentContext, RuleDeployment};
pub use error::{DeploymentError, Result};
pub use facade::{AssetStore, AttributeProcessor, ScopedFacade};
pub use facts::{FactStore, Upsert, WorkingMemory};
pub use manager::{DeploymentManager, EventSink};
pub use memory::{AttributePipeline, InMemoryAssetStore};
pub use models::{DeploymentPhase, DeploymentSnapshot, RuleUnit, Scope, UnitSnapshot, UnitStatus};
pub use scheduler::{CancelToken, DelayQueueScheduler, PendingRestart, RestartScheduler, Scheduler};
pub use session::EvaluationSession;

#[cfg(any(test, feature = "test-utils"))]
pub use scheduler::ManualScheduler;
