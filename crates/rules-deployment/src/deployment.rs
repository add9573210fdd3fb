//! 单作用域规则部署
//!
//! 编排规则集编译、延迟重启、事实回放和会话故障隔离。每个部署一把可重入锁，
//! 所有变更操作在锁内串行执行；不同作用域的部署互不影响。
//!
//! 规则动作会同步回调资产门面，门面的写入又可能经属性管道回到同一个部署。
//! 此时当前线程已持有锁并正在借用状态：事实操作进入延迟队列，由最外层持锁方
//! 在自身操作结束后依次应用；规则集操作直接返回 `Reentrant`。

use crate::error::{DeploymentError, Result};
use crate::facade::{AssetStore, AttributeProcessor, ScopedFacade};
use crate::facts::{FactStore, Upsert, WorkingMemory};
use crate::models::{
    DeploymentPhase, DeploymentSnapshot, RuleUnit, Scope, UnitSnapshot, UnitStatus,
};
use crate::scheduler::{PendingRestart, RestartScheduler};
use crate::session::EvaluationSession;
use parking_lot::ReentrantMutex;
use rule_engine::{EngineError, Fact, FactHandle, RuleEngine, SessionEnvironment};
use rules_shared::events::AttributeRef;
use rules_shared::observability::metrics::{
    record_compile_failure, record_session_error, record_session_start, record_session_stop,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

/// 创建部署所需的共享依赖
pub struct DeploymentContext<E: RuleEngine> {
    pub engine: Arc<E>,
    pub store: Arc<dyn AssetStore>,
    pub processor: Arc<dyn AttributeProcessor>,
    pub restart: RestartScheduler,
    pub fact_count_warn_delta: Option<usize>,
}

impl<E: RuleEngine> Clone for DeploymentContext<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            store: self.store.clone(),
            processor: self.processor.clone(),
            restart: self.restart.clone(),
            fact_count_warn_delta: self.fact_count_warn_delta,
        }
    }
}

enum FactOp {
    Upsert(Fact),
    Retract(AttributeRef),
}

#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    starts: u64,
    stops: u64,
    fired: u64,
}

struct State<E: RuleEngine> {
    units: BTreeMap<String, RuleUnit>,
    /// 编译成功的单元产物，源文本已丢弃
    artifacts: HashMap<String, E::Unit>,
    module: Option<Arc<E::Module>>,
    session: Option<EvaluationSession<E::Session>>,
    facts: FactStore,
    last_error: Option<DeploymentError>,
    pending_restart: PendingRestart,
    stats: Stats,
}

impl<E: RuleEngine> State<E> {
    fn phase(&self) -> DeploymentPhase {
        if self.units.is_empty() {
            DeploymentPhase::Empty
        } else if self.last_error.is_some() {
            DeploymentPhase::Error
        } else if self.session.is_some() {
            DeploymentPhase::Running
        } else if self.pending_restart.is_pending() {
            DeploymentPhase::PendingStart
        } else {
            DeploymentPhase::Stopped
        }
    }

    fn has_failed_unit(&self) -> bool {
        self.units.values().any(|u| u.status == UnitStatus::Failed)
    }
}

struct Inner<E: RuleEngine> {
    state: RefCell<State<E>>,
    deferred: RefCell<VecDeque<FactOp>>,
}

pub struct RuleDeployment<E: RuleEngine> {
    scope: Scope,
    label: String,
    engine: Arc<E>,
    facade: Arc<ScopedFacade>,
    restart: RestartScheduler,
    warn_delta: Option<usize>,
    /// 供锁外快速判断，和 `State::units` 在锁内同步更新
    unit_count: AtomicUsize,
    running: AtomicBool,
    retired: AtomicBool,
    this: Weak<Self>,
    inner: ReentrantMutex<Inner<E>>,
}

impl<E: RuleEngine> RuleDeployment<E> {
    pub fn new(scope: Scope, ctx: &DeploymentContext<E>) -> Arc<Self> {
        let facade = Arc::new(ScopedFacade::new(
            scope.clone(),
            ctx.store.clone(),
            ctx.processor.clone(),
        ));

        Arc::new_cyclic(|this| Self {
            label: scope.label(),
            scope,
            engine: ctx.engine.clone(),
            facade,
            restart: ctx.restart.clone(),
            warn_delta: ctx.fact_count_warn_delta,
            unit_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            this: this.clone(),
            inner: ReentrantMutex::new(Inner {
                state: RefCell::new(State {
                    units: BTreeMap::new(),
                    artifacts: HashMap::new(),
                    module: None,
                    session: None,
                    facts: FactStore::new(),
                    last_error: None,
                    pending_restart: PendingRestart::default(),
                    stats: Stats::default(),
                }),
                deferred: RefCell::new(VecDeque::new()),
            }),
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    // ==================== 规则集管理 ====================

    /// 插入或替换规则集，返回该单元的部署状态
    ///
    /// 编译错误不会作为 `Err` 返回，而是记录为部署状态（单元 FAILED，作用域 ERROR）。
    #[instrument(
        skip(self, unit),
        fields(scope = %self.label, unit_id = %unit.id, version = unit.version)
    )]
    pub fn insert_ruleset(&self, mut unit: RuleUnit) -> Result<UnitStatus> {
        self.with_state("insert_ruleset", |state| {
            if unit.is_blank() {
                debug!("空白规则集，无需部署");
                return UnitStatus::Deployed;
            }

            if let Some(existing) = state.units.get(&unit.id) {
                if existing.same_content(&unit) {
                    debug!(status = %existing.status, "规则集未变化，忽略重复提交");
                    return existing.status;
                }
            }

            self.stop_locked(state);
            state.units.remove(&unit.id);
            state.artifacts.remove(&unit.id);

            let id = unit.id.clone();
            let source = unit.take_source().unwrap_or_default();
            let compiled = self.engine.compile_unit(&id, &source);
            drop(source);

            match compiled {
                Ok(artifact) => {
                    unit.status = UnitStatus::Ready;
                    state.artifacts.insert(id.clone(), artifact);
                    state.units.insert(id.clone(), unit);
                    if !self.rebuild(state) {
                        // 单独可编译但与同作用域其他单元冲突，由新单元承担失败
                        state.artifacts.remove(&id);
                        if let Some(unit) = state.units.get_mut(&id) {
                            unit.status = UnitStatus::Failed;
                        }
                    }
                }
                Err(e) => {
                    unit.status = UnitStatus::Failed;
                    state.units.insert(id.clone(), unit);
                    self.quarantine(state, DeploymentError::from(e));
                }
            }

            self.unit_count.store(state.units.len(), Ordering::SeqCst);
            state
                .units
                .get(&id)
                .map_or(UnitStatus::Failed, |u| u.status)
        })
    }

    /// 撤回规则集，未知 ID 返回 `Ok(false)`
    #[instrument(skip(self), fields(scope = %self.label))]
    pub fn retract_ruleset(&self, unit_id: &str) -> Result<bool> {
        self.with_state("retract_ruleset", |state| {
            if !state.units.contains_key(unit_id) {
                debug!("规则集不存在，忽略撤回");
                return false;
            }

            self.stop_locked(state);
            state.units.remove(unit_id);
            state.artifacts.remove(unit_id);
            self.unit_count.store(state.units.len(), Ordering::SeqCst);

            if state.units.is_empty() {
                state.module = None;
                state.last_error = None;
                info!("最后一个规则集已撤回，部署进入休眠");
            } else if !state.has_failed_unit() {
                self.rebuild(state);
            }

            true
        })
    }

    /// 将全部编译产物链接为模块，返回是否链接成功
    ///
    /// 有 FAILED 单元时不链接：其余单元保持 READY，作用域错误保持不变。
    fn rebuild(&self, state: &mut State<E>) -> bool {
        if state.has_failed_unit() {
            state.module = None;
            for unit in state.units.values_mut() {
                if unit.status == UnitStatus::Deployed {
                    unit.status = UnitStatus::Ready;
                }
            }
            debug!("同作用域存在编译失败的规则集，暂不部署");
            return false;
        }

        let built = {
            let units: Vec<&E::Unit> = state
                .units
                .keys()
                .filter_map(|id| state.artifacts.get(id))
                .collect();
            self.engine.build(&units)
        };

        match built {
            Ok(module) => {
                state.module = Some(Arc::new(module));
                state.last_error = None;
                for unit in state.units.values_mut() {
                    unit.status = UnitStatus::Deployed;
                }
                info!(units = state.units.len(), "规则模块编译成功，等待延迟启动");
                self.schedule_restart(state);
                true
            }
            Err(e) => {
                self.quarantine(state, DeploymentError::from(e));
                false
            }
        }
    }

    /// 编译失败：清空模块，其余已部署单元降为 READY，不调度重启
    fn quarantine(&self, state: &mut State<E>, err: DeploymentError) {
        state.module = None;
        state.pending_restart.cancel();
        for unit in state.units.values_mut() {
            if unit.status == UnitStatus::Deployed {
                unit.status = UnitStatus::Ready;
            }
        }

        record_compile_failure(&self.label);
        warn!(scope = %self.label, code = err.code(), error = %err, "规则编译失败，作用域进入错误状态");
        state.last_error = Some(err);
    }

    fn schedule_restart(&self, state: &mut State<E>) {
        let this = self.this.clone();
        self.restart
            .schedule_restart(&mut state.pending_restart, move |epoch| {
                if let Some(deployment) = this.upgrade() {
                    deployment.on_restart_due(epoch);
                }
            });
        debug!(scope = %self.label, delay = ?self.restart.delay(), "已调度延迟重启");
    }

    /// 延迟重启到期：在锁内确认自己仍是最新的调度再启动
    fn on_restart_due(&self, epoch: u64) {
        let result = self.with_state("restart", |state| {
            if state.pending_restart.claim(epoch) {
                self.start_locked(state);
            } else {
                debug!(scope = %self.label, epoch, "延迟重启已被取消或替换");
            }
        });

        if let Err(e) = result {
            warn!(scope = %self.label, error = %e, "延迟重启未执行");
        }
    }

    // ==================== 会话生命周期 ====================

    /// 立即启动会话，返回是否确实启动
    ///
    /// 已运行、处于错误状态或没有规则集时不做任何事。
    #[instrument(skip(self), fields(scope = %self.label))]
    pub fn start(&self) -> Result<bool> {
        self.with_state("start", |state| {
            state.pending_restart.cancel();
            self.start_locked(state)
        })
    }

    fn start_locked(&self, state: &mut State<E>) -> bool {
        if self.retired.load(Ordering::SeqCst)
            || state.session.is_some()
            || state.last_error.is_some()
            || state.units.is_empty()
        {
            return false;
        }

        let Some(module) = state.module.clone() else {
            return false;
        };

        match self.boot(state, module) {
            Ok(session) => {
                let session_id = session.id();
                let facts = session.fact_count();
                state.session = Some(session);
                state.stats.starts += 1;
                self.running.store(true, Ordering::SeqCst);
                record_session_start(&self.label);
                info!(scope = %self.label, %session_id, facts, "评估会话已启动");
                true
            }
            Err(e) => {
                let err = DeploymentError::from(e);
                state.facts.detach_all();
                record_session_error(&self.label, "start");
                error!(scope = %self.label, code = err.code(), error = %err, "评估会话启动失败");
                state.last_error = Some(err);
                false
            }
        }
    }

    /// 创建会话、静默回放缓冲事实并触发一次
    ///
    /// 失败时局部会话随返回被释放。
    fn boot(
        &self,
        state: &mut State<E>,
        module: Arc<E::Module>,
    ) -> std::result::Result<EvaluationSession<E::Session>, EngineError> {
        let env = SessionEnvironment::new(self.label.clone(), self.facade.clone());
        let inner = self.engine.new_session(module, env)?;
        let mut session = EvaluationSession::new(self.label.clone(), inner, self.warn_delta);

        let replay = state.facts.drain_for_replay();
        let mut silent: HashSet<FactHandle> = HashSet::with_capacity(replay.len());
        for fact in &replay {
            let handle = session.insert(fact)?;
            state.facts.attach(&fact.identity, handle);
            silent.insert(handle);
        }

        let fired = session.fire_all(&silent)?;
        state.stats.fired += fired as u64;
        debug!(scope = %self.label, replayed = replay.len(), fired, "事实回放完成");

        Ok(session)
    }

    /// 取消待执行的重启并停止会话，缓冲事实保持不变
    #[instrument(skip(self), fields(scope = %self.label))]
    pub fn stop(&self) -> Result<()> {
        self.with_state("stop", |state| self.stop_locked(state))
    }

    fn stop_locked(&self, state: &mut State<E>) {
        if state.pending_restart.cancel() {
            debug!(scope = %self.label, "已取消待执行的重启");
        }

        if let Some(mut session) = state.session.take() {
            session.dispose();
            state.facts.detach_all();
            state.stats.stops += 1;
            self.running.store(false, Ordering::SeqCst);
            record_session_stop(&self.label);
            info!(scope = %self.label, "评估会话已停止");
        }
    }

    /// 运行期故障：立即释放会话并记录错误，不自动重启
    fn fail_running(&self, state: &mut State<E>, err: EngineError) {
        if let Some(mut session) = state.session.take() {
            session.dispose();
            state.stats.stops += 1;
        }
        state.facts.detach_all();
        state.pending_restart.cancel();
        self.running.store(false, Ordering::SeqCst);

        let err = DeploymentError::RuleExecution(err.to_string());
        record_session_error(&self.label, "execution");
        error!(scope = %self.label, code = err.code(), error = %err, "规则执行失败，会话已释放");
        state.last_error = Some(err);
    }

    // ==================== 事实 ====================

    /// 写入属性事实
    ///
    /// 调用方总是成功：会话未运行时事实被缓冲，会话故障记录在部署状态中。
    pub fn upsert_fact(&self, fact: impl Into<Fact>) {
        self.fact_op(FactOp::Upsert(fact.into()));
    }

    /// 撤回属性事实，不存在时忽略
    pub fn retract_fact(&self, identity: &AttributeRef) {
        self.fact_op(FactOp::Retract(identity.clone()));
    }

    fn fact_op(&self, op: FactOp) {
        let inner = self.inner.lock();

        let applied = match inner.state.try_borrow_mut() {
            Ok(mut state) => {
                self.apply_fact_op(&mut state, op);
                true
            }
            Err(_) => {
                debug!(scope = %self.label, "规则动作回写本作用域，延后处理");
                inner.deferred.borrow_mut().push_back(op);
                false
            }
        };

        if applied {
            self.drain_deferred(&inner);
        }
    }

    fn apply_fact_op(&self, state: &mut State<E>, op: FactOp) {
        let memory = state
            .session
            .as_mut()
            .map(|s| s as &mut dyn WorkingMemory);

        let result = match op {
            FactOp::Upsert(fact) => state
                .facts
                .upsert(fact, memory)
                .map(|outcome| matches!(outcome, Upsert::Inserted(_))),
            FactOp::Retract(identity) => state.facts.retract(&identity, memory),
        };

        match result {
            Ok(true) if state.session.is_some() => self.fire(state),
            Ok(_) => {}
            Err(e) => self.fail_running(state, e),
        }
    }

    fn fire(&self, state: &mut State<E>) {
        let Some(session) = state.session.as_mut() else {
            return;
        };

        match session.fire_all(&HashSet::new()) {
            Ok(fired) => state.stats.fired += fired as u64,
            Err(e) => self.fail_running(state, e),
        }
    }

    fn drain_deferred(&self, inner: &Inner<E>) {
        loop {
            let Some(op) = inner.deferred.borrow_mut().pop_front() else {
                break;
            };

            match inner.state.try_borrow_mut() {
                Ok(mut state) => self.apply_fact_op(&mut state, op),
                Err(_) => {
                    inner.deferred.borrow_mut().push_front(op);
                    break;
                }
            }
        }
    }

    /// 在锁内借用状态执行变更，结束后应用延后的事实操作
    fn with_state<R>(&self, op: &str, f: impl FnOnce(&mut State<E>) -> R) -> Result<R> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(DeploymentError::Retired(self.label.clone()));
        }

        let inner = self.inner.lock();
        let result = {
            let Ok(mut state) = inner.state.try_borrow_mut() else {
                return Err(DeploymentError::Reentrant(op.to_string()));
            };
            f(&mut state)
        };

        self.drain_deferred(&inner);
        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&State<E>) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let state = inner.state.try_borrow().ok()?;
        Some(f(&state))
    }

    // ==================== 查询 ====================

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 作用域错误，规则动作执行期间（状态被占用）返回 `None`
    pub fn last_error(&self) -> Option<DeploymentError> {
        self.read(|s| s.last_error.clone()).flatten()
    }

    pub fn is_error(&self) -> bool {
        self.last_error().is_some()
    }

    pub fn unit_status(&self, unit_id: &str) -> Option<UnitStatus> {
        self.read(|s| s.units.get(unit_id).map(|u| u.status)).flatten()
    }

    pub fn fact(&self, identity: &AttributeRef) -> Option<Fact> {
        self.read(|s| s.facts.get(identity).cloned()).flatten()
    }

    /// 运行中会话的工作内存事实数
    pub fn session_fact_count(&self) -> Option<usize> {
        self.read(|s| s.session.as_ref().map(|session| session.fact_count()))
            .flatten()
    }

    pub fn restart_pending(&self) -> bool {
        self.read(|s| s.pending_restart.is_pending())
            .unwrap_or(false)
    }

    pub fn phase(&self) -> Option<DeploymentPhase> {
        self.read(|s| s.phase())
    }

    pub fn is_empty(&self) -> bool {
        self.unit_count.load(Ordering::SeqCst) == 0
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<DeploymentSnapshot> {
        self.read(|s| DeploymentSnapshot {
            scope: self.label.clone(),
            phase: s.phase(),
            running: s.session.is_some(),
            error: s.last_error.as_ref().map(|e| e.to_string()),
            restart_pending: s.pending_restart.is_pending(),
            buffered_facts: s.facts.len(),
            session_facts: s.session.as_ref().map(|session| session.fact_count()),
            starts: s.stats.starts,
            stops: s.stats.stops,
            fired: s.stats.fired,
            units: s
                .units
                .values()
                .map(|u| UnitSnapshot {
                    id: u.id.clone(),
                    version: u.version,
                    status: u.status,
                })
                .collect(),
        })
    }

    /// 人类可读的诊断信息
    pub fn debug_snapshot(&self) -> String {
        match self.snapshot() {
            Some(snapshot) => snapshot.to_string(),
            None => format!("RuleDeployment[{}] <busy>", self.label),
        }
    }

    /// 尝试退役：仅在没有规则集且锁空闲时成功
    ///
    /// 退役后停止会话并拒绝后续规则集操作，由管理器从注册表中移除。
    pub fn try_retire(&self) -> bool {
        let Some(inner) = self.inner.try_lock() else {
            return false;
        };
        let Ok(mut state) = inner.state.try_borrow_mut() else {
            return false;
        };
        if !state.units.is_empty() {
            return false;
        }

        self.stop_locked(&mut state);
        self.retired.store(true, Ordering::SeqCst);
        info!(scope = %self.label, "规则部署已退役");
        true
    }

    /// 停止会话并退役，不论是否还有规则集（进程关闭时使用）
    pub fn shutdown(&self) {
        let inner = self.inner.lock();
        if let Ok(mut state) = inner.state.try_borrow_mut() {
            self.stop_locked(&mut state);
        }
        self.retired.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{MockAssetStore, MockAttributeProcessor};
    use crate::scheduler::ManualScheduler;
    use rule_engine::JsonRuleEngine;
    use rules_shared::events::AttributeEvent;
    use serde_json::json;
    use std::time::Duration;

    const VALID: &str = r#"{
        "rules": [{
            "name": "hot",
            "when": {
                "type": "group",
                "operator": "AND",
                "children": [
                    { "type": "condition", "field": "attribute", "operator": "eq", "value": "temperature" },
                    { "type": "condition", "field": "value", "operator": "gt", "value": 30 }
                ]
            },
            "then": [{ "type": "insert", "attribute": "alert", "value": true }]
        }]
    }"#;

    fn deployment() -> (Arc<RuleDeployment<JsonRuleEngine>>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let ctx = DeploymentContext {
            engine: Arc::new(JsonRuleEngine::new()),
            store: Arc::new(MockAssetStore::new()),
            processor: Arc::new(MockAttributeProcessor::new()),
            restart: RestartScheduler::new(scheduler.clone(), Duration::from_secs(2)),
            fact_count_warn_delta: None,
        };
        (RuleDeployment::new(Scope::Global, &ctx), scheduler)
    }

    #[test]
    fn test_blank_ruleset_is_noop() {
        let (deployment, scheduler) = deployment();
        let status = deployment.insert_ruleset(RuleUnit::new("r1", 1, "   ")).unwrap();

        assert_eq!(status, UnitStatus::Deployed);
        assert!(deployment.is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let (deployment, scheduler) = deployment();
        deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap();
        scheduler.advance(Duration::from_secs(2));
        assert!(deployment.is_running());

        let status = deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap();
        assert_eq!(status, UnitStatus::Deployed);
        // 未触发停止
        assert!(deployment.is_running());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_running_fact_fires_rules() {
        let (deployment, scheduler) = deployment();
        deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap();
        scheduler.advance(Duration::from_secs(2));

        deployment.upsert_fact(AttributeEvent::new("room", "temperature", 35));
        // 原事实 + 派生的 alert 事实
        assert_eq!(deployment.session_fact_count(), Some(2));
        assert_eq!(deployment.snapshot().unwrap().fired, 1);
    }

    #[test]
    fn test_runtime_fault_disposes_session() {
        let (deployment, scheduler) = deployment();
        deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap();
        scheduler.advance(Duration::from_secs(2));

        // 字符串与数字比较在求值时报错
        deployment.upsert_fact(AttributeEvent::new("room", "temperature", "warm"));

        assert!(!deployment.is_running());
        assert!(matches!(
            deployment.last_error(),
            Some(DeploymentError::RuleExecution(_))
        ));
        // 事实仍被保存
        let fact = deployment.fact(&AttributeRef::new("room", "temperature")).unwrap();
        assert_eq!(fact.value, json!("warm"));
        // 不会自动重启
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_replayed_fault_is_session_start_error() {
        let (deployment, scheduler) = deployment();
        deployment.upsert_fact(AttributeEvent::new("room", "temperature", "warm"));
        deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap();
        scheduler.advance(Duration::from_secs(2));

        assert!(!deployment.is_running());
        assert!(matches!(
            deployment.last_error(),
            Some(DeploymentError::SessionStart(_))
        ));
        assert_eq!(deployment.phase(), Some(DeploymentPhase::Error));
    }

    #[test]
    fn test_link_conflict_fails_inserted_unit() {
        let (deployment, scheduler) = deployment();
        deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap();
        scheduler.advance(Duration::from_secs(2));
        assert!(deployment.is_running());

        // 同名规则 "hot" 出现在两个规则集中
        let status = deployment.insert_ruleset(RuleUnit::new("r2", 1, VALID)).unwrap();

        assert_eq!(status, UnitStatus::Failed);
        assert_eq!(deployment.unit_status("r1"), Some(UnitStatus::Ready));
        assert_eq!(deployment.unit_status("r2"), Some(UnitStatus::Failed));
        assert!(matches!(deployment.last_error(), Some(DeploymentError::Compile(_))));
        assert!(!deployment.is_running());
        assert_eq!(scheduler.pending_count(), 0);

        // 撤回冲突单元后恢复
        assert!(deployment.retract_ruleset("r2").unwrap());
        assert!(deployment.last_error().is_none());
        assert_eq!(deployment.unit_status("r1"), Some(UnitStatus::Deployed));
        scheduler.advance(Duration::from_secs(2));
        assert!(deployment.is_running());
    }

    #[test]
    fn test_retired_deployment_rejects_rulesets() {
        let (deployment, _) = deployment();
        assert!(deployment.try_retire());

        let err = deployment.insert_ruleset(RuleUnit::new("r1", 1, VALID)).unwrap_err();
        assert!(matches!(err, DeploymentError::Retired(_)));
    }

    #[test]
    fn test_debug_snapshot_lists_units() {
        let (deployment, _) = deployment();
        deployment.insert_ruleset(RuleUnit::new("r1", 3, VALID)).unwrap();

        let text = deployment.debug_snapshot();
        assert!(text.contains("RuleDeployment[global] PENDING_START"));
        assert!(text.contains("r1 v3: DEPLOYED"));
    }
}
