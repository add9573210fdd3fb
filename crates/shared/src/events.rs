//! 属性事件模型
//!
//! 上游属性处理管道推送的属性变更事件，以及标识一个属性的引用（实体 ID + 属性名）。
//! 规则部署以属性引用作为事实身份：同一引用的多次更新是同一个事实。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 属性引用
///
/// 只描述"哪个实体的哪个属性"，不包含值。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeRef {
    pub entity_id: String,
    pub attribute_name: String,
}

impl AttributeRef {
    pub fn new(entity_id: impl Into<String>, attribute_name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_name: attribute_name.into(),
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.attribute_name)
    }
}

/// 属性变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEvent {
    pub entity_id: String,
    pub attribute_name: String,
    pub value: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AttributeEvent {
    /// 创建事件，时间戳取当前时间
    pub fn new(
        entity_id: impl Into<String>,
        attribute_name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_name: attribute_name.into(),
            value: value.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 事件对应的属性引用
    pub fn attribute_ref(&self) -> AttributeRef {
        AttributeRef::new(self.entity_id.clone(), self.attribute_name.clone())
    }
}

impl fmt::Display for AttributeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} = {} @ {}",
            self.entity_id,
            self.attribute_name,
            self.value,
            self.timestamp.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_ref_identity_ignores_value() {
        let first = AttributeEvent::new("asset-1", "temperature", 21);
        let second = AttributeEvent::new("asset-1", "temperature", 22);

        assert_ne!(first, second);
        assert_eq!(first.attribute_ref(), second.attribute_ref());
    }

    #[test]
    fn test_event_deserialization_defaults_timestamp() {
        let event: AttributeEvent = serde_json::from_value(json!({
            "entity_id": "asset-1",
            "attribute_name": "on",
            "value": true
        }))
        .unwrap();

        assert_eq!(event.value, json!(true));
        assert!(event.timestamp <= Utc::now());
    }

    #[test]
    fn test_display() {
        let attr = AttributeRef::new("asset-1", "humidity");
        assert_eq!(attr.to_string(), "asset-1:humidity");
    }
}
