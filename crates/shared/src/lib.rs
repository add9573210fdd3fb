//! 共享库
//!
//! 包含规则部署服务各 crate 共用的配置、可观测性、属性事件与资产查询模型。

pub mod assets;
pub mod config;
pub mod events;
pub mod observability;
