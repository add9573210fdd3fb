//! 内存协作方
//!
//! 服务进程和测试使用的资产存储与属性处理管道。属性管道先写入资产存储，
//! 再把事件交给部署管理器作为事实路由；规则动作的写入也经过同一条管道。

use crate::facade::{AssetStore, AttributeProcessor};
use crate::manager::EventSink;
use dashmap::DashMap;
use rule_engine::ActionError;
use rules_shared::assets::{AssetQuery, EntityRecord};
use rules_shared::events::AttributeEvent;
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

/// 内存资产存储
#[derive(Default)]
pub struct InMemoryAssetStore {
    entities: DashMap<String, EntityRecord>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = EntityRecord>) -> Self {
        let store = Self::new();
        for entity in entities {
            store.insert(entity);
        }
        store
    }

    pub fn insert(&self, entity: EntityRecord) {
        self.entities.insert(entity.id.clone(), entity);
    }

    pub fn remove(&self, id: &str) -> Option<EntityRecord> {
        self.entities.remove(id).map(|(_, entity)| entity)
    }

    pub fn attribute(&self, entity_id: &str, name: &str) -> Option<Value> {
        self.entities
            .get(entity_id)
            .and_then(|e| e.attributes.get(name).cloned())
    }

    /// 写入属性值，实体不存在时返回 false
    pub fn set_attribute(&self, entity_id: &str, name: &str, value: Value) -> bool {
        match self.entities.get_mut(entity_id) {
            Some(mut entity) => {
                entity.attributes.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl AssetStore for InMemoryAssetStore {
    fn find_entity(&self, id: &str) -> Option<EntityRecord> {
        self.entities.get(id).map(|e| e.value().clone())
    }

    fn find_entities(&self, query: &AssetQuery) -> Vec<EntityRecord> {
        let candidates: Vec<EntityRecord> =
            self.entities.iter().map(|e| e.value().clone()).collect();
        query.apply(&candidates)
    }
}

/// 属性处理管道
///
/// 同步处理：写入存储后立即路由，规则动作的级联写入在同一线程内完成。
pub struct AttributePipeline {
    store: Arc<InMemoryAssetStore>,
    sink: OnceLock<Weak<dyn EventSink>>,
}

impl AttributePipeline {
    pub fn new(store: Arc<InMemoryAssetStore>) -> Self {
        Self {
            store,
            sink: OnceLock::new(),
        }
    }

    /// 连接事件接收方（部署管理器），只能连接一次
    pub fn connect(&self, sink: Weak<dyn EventSink>) {
        if self.sink.set(sink).is_err() {
            warn!("属性管道已连接，忽略重复连接");
        }
    }

    /// 处理上游属性事件
    pub fn process(&self, event: AttributeEvent) -> Result<(), ActionError> {
        if !self
            .store
            .set_attribute(&event.entity_id, &event.attribute_name, event.value.clone())
        {
            return Err(ActionError::Collaborator(format!(
                "实体 {} 不存在",
                event.entity_id
            )));
        }

        match self.sink.get().and_then(Weak::upgrade) {
            Some(sink) => sink.accept(event),
            None => debug!(entity = %event.entity_id, "属性管道未连接，事件只写入存储"),
        }

        Ok(())
    }
}

impl AttributeProcessor for AttributePipeline {
    fn update_attribute(&self, event: AttributeEvent) -> Result<(), ActionError> {
        self.process(event)
    }
}
