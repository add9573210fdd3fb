//! 规则部署管理器
//!
//! 按作用域维护规则部署注册表：首个规则集到达时创建部署，最后一个规则集撤回时
//! 退役并移除。属性事件按实体路由到全局、所属租户以及路径上每个资产的部署，
//! 同时保留每个属性的最新值，新建的部署用它补齐当前状态。

use crate::deployment::{DeploymentContext, RuleDeployment};
use crate::error::{DeploymentError, Result};
use crate::models::{RuleUnit, Scope, UnitStatus};
use dashmap::DashMap;
use rule_engine::RuleEngine;
use rules_shared::events::{AttributeEvent, AttributeRef};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// 属性事件的接收方
pub trait EventSink: Send + Sync {
    fn accept(&self, event: AttributeEvent);
}

pub struct DeploymentManager<E: RuleEngine> {
    ctx: DeploymentContext<E>,
    deployments: DashMap<Scope, Arc<RuleDeployment<E>>>,
    /// attribute -> 最新事件
    latest: DashMap<AttributeRef, AttributeEvent>,
    shut_down: AtomicBool,
}

impl<E: RuleEngine> DeploymentManager<E> {
    pub fn new(ctx: DeploymentContext<E>) -> Self {
        Self {
            ctx,
            deployments: DashMap::new(),
            latest: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// 向作用域插入规则集，必要时创建部署
    pub fn insert_ruleset(&self, scope: Scope, unit: RuleUnit) -> Result<UnitStatus> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DeploymentError::Retired(scope.label()));
        }

        if unit.is_blank() {
            return Ok(UnitStatus::Deployed);
        }

        loop {
            let deployment = self.get_or_create(&scope);
            match deployment.insert_ruleset(unit.clone()) {
                // 与撤回竞争时拿到了刚退役的部署，换一个新的重试
                Err(DeploymentError::Retired(_)) => {
                    self.deployments
                        .remove_if(&scope, |_, current| Arc::ptr_eq(current, &deployment));
                }
                other => return other,
            }
        }
    }

    /// 撤回规则集，作用域内没有规则集后退役部署
    pub fn retract_ruleset(&self, scope: &Scope, unit_id: &str) -> Result<bool> {
        let Some(deployment) = self.deployment(scope) else {
            return Ok(false);
        };

        let removed = match deployment.retract_ruleset(unit_id) {
            Err(DeploymentError::Retired(_)) => false,
            other => other?,
        };

        if deployment.is_empty() {
            let retired = self.deployments.remove_if(scope, |_, current| {
                Arc::ptr_eq(current, &deployment) && current.try_retire()
            });
            if retired.is_some() {
                info!(scope = %scope, "规则部署已移除");
            }
        }

        Ok(removed)
    }

    /// 路由属性事件到所有相关作用域
    pub fn route(&self, event: AttributeEvent) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        self.latest.insert(event.attribute_ref(), event.clone());

        for scope in self.scopes_for(&event.entity_id) {
            // 先克隆出部署再调用，避免持有分段锁时进入规则执行
            if let Some(deployment) = self.deployment(&scope) {
                deployment.upsert_fact(event.clone());
            }
        }
    }

    /// 撤回属性（例如实体被删除），同时清除最新值缓存
    pub fn retract_attribute(&self, attribute: &AttributeRef) {
        self.latest.remove(attribute);

        for scope in self.scopes_for(&attribute.entity_id) {
            if let Some(deployment) = self.deployment(&scope) {
                deployment.retract_fact(attribute);
            }
        }
    }

    fn scopes_for(&self, entity_id: &str) -> Vec<Scope> {
        let mut scopes = vec![Scope::Global];
        if let Some(entity) = self.ctx.store.find_entity(entity_id) {
            scopes.push(Scope::Tenant(entity.tenant));
            scopes.extend(entity.path.into_iter().map(Scope::Asset));
        }
        scopes
    }

    fn get_or_create(&self, scope: &Scope) -> Arc<RuleDeployment<E>> {
        if let Some(existing) = self.deployment(scope) {
            return existing;
        }

        self.deployments
            .entry(scope.clone())
            .or_insert_with(|| {
                let deployment = RuleDeployment::new(scope.clone(), &self.ctx);
                self.seed(&deployment);
                info!(scope = %scope, "规则部署已创建");
                deployment
            })
            .value()
            .clone()
    }

    /// 用最新值缓存为新部署补齐属于该作用域的事实
    fn seed(&self, deployment: &RuleDeployment<E>) {
        let mut events: Vec<AttributeEvent> = self
            .latest
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|event| self.scopes_for(&event.entity_id).contains(deployment.scope()))
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        debug!(scope = %deployment.scope(), facts = events.len(), "补齐作用域事实");
        for event in events {
            deployment.upsert_fact(event);
        }
    }

    pub fn deployment(&self, scope: &Scope) -> Option<Arc<RuleDeployment<E>>> {
        self.deployments.get(scope).map(|d| d.value().clone())
    }

    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.deployments.iter().map(|e| e.key().clone()).collect();
        scopes.sort();
        scopes
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }

    pub fn is_running(&self, scope: &Scope) -> bool {
        self.deployment(scope).is_some_and(|d| d.is_running())
    }

    pub fn last_error(&self, scope: &Scope) -> Option<DeploymentError> {
        self.deployment(scope).and_then(|d| d.last_error())
    }

    /// 所有部署的诊断信息，按作用域排序
    pub fn debug_snapshot(&self) -> String {
        self.scopes()
            .iter()
            .filter_map(|scope| self.deployment(scope))
            .map(|d| d.debug_snapshot())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 停止所有会话并拒绝后续操作
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let deployments: Vec<Arc<RuleDeployment<E>>> =
            self.deployments.iter().map(|e| e.value().clone()).collect();
        for deployment in &deployments {
            deployment.shutdown();
        }
        self.deployments.clear();

        info!(count = deployments.len(), "规则部署管理器已关闭");
    }
}

impl<E: RuleEngine> EventSink for DeploymentManager<E> {
    fn accept(&self, event: AttributeEvent) {
        self.route(event);
    }
}
