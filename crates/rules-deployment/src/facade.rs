//! 作用域受限的资产门面
//!
//! 规则动作读写外部资产状态的唯一入口。非全局作用域强制附加租户或子树过滤，
//! 任何试图放宽作用域的查询条件都以授权错误拒绝，而不是静默收窄。

use crate::models::Scope;
use rule_engine::{ActionError, Assets};
use rules_shared::assets::{AssetQuery, EntityRecord};
use rules_shared::events::AttributeEvent;
use rules_shared::observability::metrics::record_scope_rejection;
use std::sync::Arc;
use tracing::debug;

/// 资产存储协作方
#[cfg_attr(test, mockall::automock)]
pub trait AssetStore: Send + Sync {
    fn find_entity(&self, id: &str) -> Option<EntityRecord>;

    fn find_entities(&self, query: &AssetQuery) -> Vec<EntityRecord>;
}

/// 属性处理协作方
#[cfg_attr(test, mockall::automock)]
pub trait AttributeProcessor: Send + Sync {
    fn update_attribute(&self, event: AttributeEvent) -> Result<(), ActionError>;
}

pub struct ScopedFacade {
    scope: Scope,
    label: String,
    store: Arc<dyn AssetStore>,
    processor: Arc<dyn AttributeProcessor>,
}

impl ScopedFacade {
    pub fn new(
        scope: Scope,
        store: Arc<dyn AssetStore>,
        processor: Arc<dyn AttributeProcessor>,
    ) -> Self {
        Self {
            label: scope.label(),
            scope,
            store,
            processor,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// 把查询条件限制在作用域内
    pub fn restrict(&self, mut query: AssetQuery) -> Result<AssetQuery, ActionError> {
        match &self.scope {
            Scope::Global => Ok(query),
            Scope::Tenant(tenant) => {
                self.reject_shaping(&query)?;
                self.reject_tenant_override(&query, tenant)?;
                query.tenant = Some(tenant.clone());
                Ok(query)
            }
            Scope::Asset(root_id) => {
                let root = self.store.find_entity(root_id).ok_or_else(|| {
                    ActionError::ScopeUnavailable(format!("作用域根实体 {} 不存在", root_id))
                })?;

                self.reject_shaping(&query)?;
                self.reject_tenant_override(&query, &root.tenant)?;

                let prefix = match query.path_prefix.take() {
                    None => root.path.clone(),
                    // 子树内更深的前缀只会收窄结果
                    Some(prefix) if prefix.starts_with(&root.path) => prefix,
                    Some(prefix) => {
                        return Err(self.reject(format!(
                            "路径 {} 不在作用域子树 {} 内",
                            prefix.join("/"),
                            root.path.join("/")
                        )));
                    }
                };
                query.path_prefix = Some(prefix);
                query.tenant = Some(root.tenant);
                Ok(query)
            }
        }
    }

    fn reject_shaping(&self, query: &AssetQuery) -> Result<(), ActionError> {
        if query.select.is_some() || query.order_by.is_some() {
            return Err(self.reject("只有全局作用域可以设置 select 或 order_by".to_string()));
        }
        Ok(())
    }

    fn reject_tenant_override(&self, query: &AssetQuery, tenant: &str) -> Result<(), ActionError> {
        match &query.tenant {
            Some(requested) if requested != tenant => Err(self.reject(format!(
                "不能查询租户 {}，作用域限定为租户 {}",
                requested, tenant
            ))),
            _ => Ok(()),
        }
    }

    fn reject(&self, reason: String) -> ActionError {
        record_scope_rejection(&self.label);
        debug!(scope = %self.label, %reason, "拒绝越权的资产访问");
        ActionError::ScopeAuthorization(reason)
    }
}

impl Assets for ScopedFacade {
    fn query(&self, query: AssetQuery) -> Result<Vec<String>, ActionError> {
        let restricted = self.restrict(query)?;

        // 结果再按受限条件过滤一次，不依赖存储实现完整支持所有条件
        Ok(self
            .store
            .find_entities(&restricted)
            .into_iter()
            .filter(|e| restricted.matches(e))
            .map(|e| e.id)
            .collect())
    }

    fn dispatch(&self, event: AttributeEvent) -> Result<(), ActionError> {
        let probe = self.restrict(AssetQuery::new().id(event.entity_id.clone()))?;
        let reachable = self
            .store
            .find_entities(&probe)
            .iter()
            .any(|e| e.id == event.entity_id && probe.matches(e));

        if !reachable {
            return Err(self.reject(format!(
                "实体 {} 不在作用域 {} 内",
                event.entity_id, self.label
            )));
        }

        self.processor.update_attribute(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rules_shared::assets::{OrderBy, OrderProperty};

    fn tree() -> Vec<EntityRecord> {
        let site = EntityRecord::new("site", "Site", "acme", None);
        let floor = EntityRecord::new("floor", "Floor", "acme", Some(&site));
        let room = EntityRecord::new("room", "Room", "acme", Some(&floor));
        let lobby = EntityRecord::new("lobby", "Lobby", "acme", Some(&site));
        let rival = EntityRecord::new("rival", "Rival", "globex", None);
        vec![site, floor, room, lobby, rival]
    }

    fn store() -> MockAssetStore {
        let entities = tree();
        let lookup = entities.clone();
        let mut store = MockAssetStore::new();
        store
            .expect_find_entity()
            .returning(move |id| lookup.iter().find(|e| e.id == id).cloned());
        store
            .expect_find_entities()
            .returning(move |query| query.apply(&entities));
        store
    }

    fn facade(scope: Scope, processor: MockAttributeProcessor) -> ScopedFacade {
        ScopedFacade::new(scope, Arc::new(store()), Arc::new(processor))
    }

    #[test]
    fn test_global_scope_is_unrestricted() {
        let facade = facade(Scope::Global, MockAttributeProcessor::new());
        let query = AssetQuery::new().order_by(OrderBy {
            property: OrderProperty::Id,
            descending: false,
        });

        let ids = facade.query(query).unwrap();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_tenant_scope_forces_tenant_filter() {
        let facade = facade(Scope::tenant("acme"), MockAttributeProcessor::new());

        let ids = facade.query(AssetQuery::new()).unwrap();
        assert!(!ids.contains(&"rival".to_string()));
        assert_eq!(ids.len(), 4);

        let err = facade.query(AssetQuery::new().tenant("globex")).unwrap_err();
        assert!(matches!(err, ActionError::ScopeAuthorization(_)));
    }

    #[test]
    fn test_tenant_scope_rejects_shaping() {
        let facade = facade(Scope::tenant("acme"), MockAttributeProcessor::new());
        let query = AssetQuery::new().order_by(OrderBy {
            property: OrderProperty::Name,
            descending: true,
        });
        assert!(matches!(
            facade.query(query),
            Err(ActionError::ScopeAuthorization(_))
        ));
    }

    #[test]
    fn test_asset_scope_limits_to_subtree() {
        let facade = facade(Scope::asset("floor"), MockAttributeProcessor::new());

        let ids = facade.query(AssetQuery::new()).unwrap();
        assert_eq!(ids, vec!["floor", "room"]);

        let outside = AssetQuery::new().path_prefix(vec!["site".to_string()]);
        assert!(matches!(
            facade.query(outside),
            Err(ActionError::ScopeAuthorization(_))
        ));

        let deeper = AssetQuery::new().path_prefix(vec![
            "site".to_string(),
            "floor".to_string(),
            "room".to_string(),
        ]);
        assert_eq!(facade.query(deeper).unwrap(), vec!["room"]);
    }

    #[test]
    fn test_asset_scope_dispatch_outside_subtree_is_rejected() {
        let mut processor = MockAttributeProcessor::new();
        processor
            .expect_update_attribute()
            .withf(|e| e.entity_id == "room")
            .times(1)
            .returning(|_| Ok(()));

        let facade = facade(Scope::asset("floor"), processor);

        facade
            .dispatch(AttributeEvent::new("room", "light", true))
            .unwrap();

        let err = facade
            .dispatch(AttributeEvent::new("lobby", "light", true))
            .unwrap_err();
        assert!(matches!(err, ActionError::ScopeAuthorization(_)));
    }

    #[test]
    fn test_missing_asset_root_is_unavailable() {
        let facade = facade(Scope::asset("demolished"), MockAttributeProcessor::new());
        assert!(matches!(
            facade.query(AssetQuery::new()),
            Err(ActionError::ScopeUnavailable(_))
        ));
    }

    #[test]
    fn test_tenant_dispatch_to_other_tenant_is_rejected() {
        let mut processor = MockAttributeProcessor::new();
        processor.expect_update_attribute().never();

        let facade = facade(Scope::tenant("acme"), processor);
        let err = facade
            .dispatch(AttributeEvent::new("rival", "alarm", "on"))
            .unwrap_err();
        assert!(matches!(err, ActionError::ScopeAuthorization(_)));
    }
}
