//! 评估会话包装
//!
//! 持有一个引擎会话实例，负责释放、事实数观测和触发指标。
//! 事实数变化只作为可观测信号：每次触发后记录 debug 日志并更新 gauge，
//! 配置了增长阈值时输出告警，但从不限制工作内存大小。

use crate::facts::WorkingMemory;
use rule_engine::{EngineError, EngineSession, Fact, FactHandle};
use rules_shared::observability::metrics::{record_rules_fired, set_session_fact_count};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct EvaluationSession<S: EngineSession> {
    id: Uuid,
    scope: String,
    inner: S,
    last_fact_count: usize,
    warn_delta: Option<usize>,
    disposed: bool,
}

impl<S: EngineSession> EvaluationSession<S> {
    pub fn new(scope: impl Into<String>, inner: S, warn_delta: Option<usize>) -> Self {
        let scope = scope.into();
        let id = Uuid::now_v7();
        debug!(%scope, session_id = %id, "评估会话已创建");

        Self {
            id,
            scope,
            last_fact_count: inner.fact_count(),
            inner,
            warn_delta,
            disposed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn insert(&mut self, fact: &Fact) -> Result<FactHandle, EngineError> {
        self.inner.insert(fact)
    }

    pub fn retract(&mut self, handle: FactHandle) -> Result<(), EngineError> {
        self.inner.retract(handle)
    }

    /// 触发议程，`suppressed` 中句柄引起的激活不执行（尽力而为）
    pub fn fire_all(&mut self, suppressed: &HashSet<FactHandle>) -> Result<usize, EngineError> {
        let fired = self.inner.fire_all(suppressed)?;
        if fired > 0 {
            record_rules_fired(&self.scope, fired);
        }
        self.observe_fact_count();
        Ok(fired)
    }

    pub fn fact_count(&self) -> usize {
        self.inner.fact_count()
    }

    fn observe_fact_count(&mut self) {
        let count = self.inner.fact_count();
        let previous = self.last_fact_count;
        self.last_fact_count = count;

        if count == previous {
            return;
        }

        debug!(
            scope = %self.scope,
            session_id = %self.id,
            previous,
            count,
            "工作内存事实数变化"
        );
        set_session_fact_count(&self.scope, count);

        if let Some(delta) = self.warn_delta {
            if count >= previous.saturating_add(delta) {
                warn!(
                    scope = %self.scope,
                    session_id = %self.id,
                    previous,
                    count,
                    delta,
                    "单次触发后工作内存增长过快，请检查规则是否存在循环插入"
                );
            }
        }
    }

    /// 停止并释放会话，可重复调用
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.inner.halt();
        self.inner.dispose();
        self.disposed = true;
        set_session_fact_count(&self.scope, 0);
        debug!(scope = %self.scope, session_id = %self.id, "评估会话已释放");
    }

    #[cfg(test)]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<S: EngineSession> WorkingMemory for EvaluationSession<S> {
    fn insert(&mut self, fact: &Fact) -> Result<FactHandle, EngineError> {
        EvaluationSession::insert(self, fact)
    }

    fn retract(&mut self, handle: FactHandle) -> Result<(), EngineError> {
        EvaluationSession::retract(self, handle)
    }
}

impl<S: EngineSession> Drop for EvaluationSession<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
