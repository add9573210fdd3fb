//! 资产模型与查询条件
//!
//! 资产存储协作方返回的实体记录，以及规则动作通过受限门面发出的查询条件。
//! 实体以路径（从根到自身的实体 ID 序列）组织成树，资产作用域即某个节点的子树。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 实体记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    pub tenant: String,
    /// 从根到自身的实体 ID 路径，最后一个元素是自身
    pub path: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl EntityRecord {
    /// 创建实体，路径由父实体路径推导
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        tenant: impl Into<String>,
        parent: Option<&EntityRecord>,
    ) -> Self {
        let id = id.into();
        let mut path = parent.map(|p| p.path.clone()).unwrap_or_default();
        path.push(id.clone());

        Self {
            id,
            name: name.into(),
            tenant: tenant.into(),
            path,
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// 是否位于以 `root_path` 为根的子树内（包括根自身）
    pub fn is_within(&self, root_path: &[String]) -> bool {
        self.path.starts_with(root_path)
    }
}

/// 查询投影：只保留指定属性
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Select {
    pub attributes: Vec<String>,
}

impl Select {
    pub fn project(&self, mut entity: EntityRecord) -> EntityRecord {
        entity
            .attributes
            .retain(|name, _| self.attributes.iter().any(|a| a == name));
        entity
    }
}

/// 排序字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderProperty {
    Id,
    Name,
    CreatedOn,
}

/// 查询排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub property: OrderProperty,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn sort(&self, entities: &mut [EntityRecord]) {
        entities.sort_by(|a, b| {
            let ordering = match self.property {
                OrderProperty::Id => a.id.cmp(&b.id),
                OrderProperty::Name => a.name.cmp(&b.name),
                OrderProperty::CreatedOn => a.created_at.cmp(&b.created_at),
            };
            if self.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
}

/// 资产查询条件
///
/// 所有条件之间为 AND 关系，未设置的条件不参与过滤。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetQuery {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    /// 子树过滤：实体路径必须以此为前缀
    #[serde(default)]
    pub path_prefix: Option<Vec<String>>,
    /// 实体必须拥有该属性
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub select: Option<Select>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
}

impl AssetQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn path_prefix(mut self, path: Vec<String>) -> Self {
        self.path_prefix = Some(path);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attribute = Some(name.into());
        self
    }

    pub fn select(mut self, select: Select) -> Self {
        self.select = Some(select);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    /// 判断实体是否满足过滤条件（不涉及投影和排序）
    pub fn matches(&self, entity: &EntityRecord) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &entity.id) {
            return false;
        }

        if let Some(tenant) = &self.tenant {
            if tenant != &entity.tenant {
                return false;
            }
        }

        if let Some(prefix) = &self.path_prefix {
            if !entity.is_within(prefix) {
                return false;
            }
        }

        if let Some(attribute) = &self.attribute {
            if !entity.attributes.contains_key(attribute) {
                return false;
            }
        }

        true
    }

    /// 对候选实体应用过滤、排序和投影
    pub fn apply<'a>(
        &self,
        entities: impl IntoIterator<Item = &'a EntityRecord>,
    ) -> Vec<EntityRecord> {
        let mut result: Vec<EntityRecord> = entities
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();

        match &self.order_by {
            Some(order_by) => order_by.sort(&mut result),
            // 默认按层级深度排序，祖先在前，同层按 ID
            None => result.sort_by(|a, b| {
                a.path.len().cmp(&b.path.len()).then_with(|| a.id.cmp(&b.id))
            }),
        }

        if let Some(select) = &self.select {
            result = result.into_iter().map(|e| select.project(e)).collect();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> Vec<EntityRecord> {
        let site = EntityRecord::new("site", "Site", "acme", None);
        let building = EntityRecord::new("building", "Building", "acme", Some(&site))
            .with_attribute("temperature", 20);
        let room = EntityRecord::new("room", "Room", "acme", Some(&building))
            .with_attribute("temperature", 21)
            .with_attribute("occupied", true);
        let other = EntityRecord::new("other", "Other", "globex", None);
        vec![site, building, room, other]
    }

    #[test]
    fn test_entity_path() {
        let tree = sample_tree();
        assert_eq!(tree[2].path, vec!["site", "building", "room"]);
        assert!(tree[2].is_within(&tree[1].path));
        assert!(!tree[1].is_within(&tree[2].path));
    }

    #[test]
    fn test_query_filters_are_conjunctive() {
        let tree = sample_tree();
        let query = AssetQuery::new().tenant("acme").attribute("temperature");

        let ids: Vec<String> = query.apply(&tree).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["building", "room"]);
    }

    #[test]
    fn test_query_path_prefix() {
        let tree = sample_tree();
        let query = AssetQuery::new().path_prefix(tree[1].path.clone());

        let ids: Vec<String> = query.apply(&tree).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["building", "room"]);
    }

    #[test]
    fn test_default_order_is_shallowest_first() {
        let mut tree = sample_tree();
        tree.reverse();

        // 根实体在前，同层按 ID 排序
        let ids: Vec<String> = AssetQuery::new().apply(&tree).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["other", "site", "building", "room"]);
    }

    #[test]
    fn test_order_and_select() {
        let tree = sample_tree();
        let query = AssetQuery::new()
            .tenant("acme")
            .order_by(OrderBy {
                property: OrderProperty::Name,
                descending: true,
            })
            .select(Select {
                attributes: vec!["occupied".to_string()],
            });

        let result = query.apply(&tree);
        let names: Vec<&str> = result.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Site", "Room", "Building"]);
        assert_eq!(result[1].attributes.get("occupied"), Some(&json!(true)));
        assert!(!result[1].attributes.contains_key("temperature"));
    }

    #[test]
    fn test_query_deserialization() {
        let query: AssetQuery = serde_json::from_value(json!({
            "tenant": "acme",
            "order_by": { "property": "created_on" }
        }))
        .unwrap();

        assert_eq!(query.tenant.as_deref(), Some("acme"));
        assert!(query.ids.is_empty());
        assert!(!query.order_by.unwrap().descending);
    }
}
