//! 事实存储
//!
//! 维护属性引用到当前事实及其会话句柄的映射，保证任一时刻每个属性引用
//! 最多只有一个有效事实。会话停止期间事实只做缓冲（无句柄），会话启动时
//! 按插入顺序整体回放；存储本身始终是事实的权威来源。

use rule_engine::{EngineError, Fact, FactHandle};
use rules_shared::events::AttributeRef;
use std::collections::HashMap;
use tracing::debug;

/// 事实存储写入会话时依赖的工作内存能力
#[cfg_attr(test, mockall::automock)]
pub trait WorkingMemory {
    fn insert(&mut self, fact: &Fact) -> Result<FactHandle, EngineError>;

    fn retract(&mut self, handle: FactHandle) -> Result<(), EngineError>;
}

/// 写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// 与当前事实的值和时间戳完全相同，未做任何改动
    Unchanged,
    /// 会话未运行，事实已缓冲
    Buffered,
    /// 已写入运行中的会话
    Inserted(FactHandle),
}

#[derive(Debug)]
struct Entry {
    fact: Fact,
    handle: Option<FactHandle>,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct FactStore {
    entries: HashMap<AttributeRef, Entry>,
    next_seq: u64,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入事实：先撤回同一引用的旧事实，再插入新事实
    ///
    /// 会话调用失败时新事实仍然以缓冲状态保存，错误返回给调用方处理。
    pub fn upsert(
        &mut self,
        fact: Fact,
        memory: Option<&mut dyn WorkingMemory>,
    ) -> Result<Upsert, EngineError> {
        if let Some(current) = self.entries.get(&fact.identity) {
            if current.fact.same_update(&fact) {
                debug!(fact = %fact.identity, "重复的事实更新，忽略");
                return Ok(Upsert::Unchanged);
            }
        }

        let previous = self.entries.remove(&fact.identity);
        let seq = self.next_seq;
        self.next_seq += 1;

        let Some(memory) = memory else {
            self.entries.insert(
                fact.identity.clone(),
                Entry {
                    fact,
                    handle: None,
                    seq,
                },
            );
            return Ok(Upsert::Buffered);
        };

        let result = Self::replace(memory, previous.and_then(|e| e.handle), &fact);
        let handle = result.as_ref().ok().copied();
        self.entries
            .insert(fact.identity.clone(), Entry { fact, handle, seq });

        result.map(Upsert::Inserted)
    }

    fn replace(
        memory: &mut dyn WorkingMemory,
        previous: Option<FactHandle>,
        fact: &Fact,
    ) -> Result<FactHandle, EngineError> {
        if let Some(handle) = previous {
            memory.retract(handle)?;
        }
        memory.insert(fact)
    }

    /// 撤回事实，找不到不算错误（调用方之间可能存在竞争）
    pub fn retract(
        &mut self,
        identity: &AttributeRef,
        memory: Option<&mut dyn WorkingMemory>,
    ) -> Result<bool, EngineError> {
        let Some(entry) = self.entries.remove(identity) else {
            debug!(fact = %identity, "撤回的事实不存在，忽略");
            return Ok(false);
        };

        if let (Some(handle), Some(memory)) = (entry.handle, memory) {
            memory.retract(handle)?;
        }

        Ok(true)
    }

    /// 按插入顺序返回全部事实，用于会话启动时回放
    ///
    /// 不会清空存储，每次启动都从当前状态重新生成。
    pub fn drain_for_replay(&self) -> Vec<Fact> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.fact.clone()).collect()
    }

    /// 回放成功后记录事实在新会话中的句柄
    pub fn attach(&mut self, identity: &AttributeRef, handle: FactHandle) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.handle = Some(handle);
        }
    }

    /// 会话释放后所有句柄失效
    pub fn detach_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.handle = None;
        }
    }

    pub fn get(&self, identity: &AttributeRef) -> Option<&Fact> {
        self.entries.get(identity).map(|e| &e.fact)
    }

    #[cfg(test)]
    pub fn handle_of(&self, identity: &AttributeRef) -> Option<FactHandle> {
        self.entries.get(identity).and_then(|e| e.handle)
    }

    /// 已写入会话的事实数
    #[cfg(test)]
    pub fn attached_count(&self) -> usize {
        self.entries.values().filter(|e| e.handle.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
