//! Memory blocks - labeled, size-bounded text owned by one agent

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConclaveError;

/// What to do with a write that exceeds a block's limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    /// Fail with `LimitExceeded` and leave the block untouched
    #[default]
    Reject,
    /// Keep the first `limit` characters
    Truncate,
}

/// A labeled text value with a character limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub label: String,
    value: String,
    pub limit: usize,
    /// Mirrored from another agent; tools may not write it
    #[serde(default)]
    pub read_only: bool,
}

impl MemoryBlock {
    /// Create an empty block
    pub fn new(label: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            value: String::new(),
            limit,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Length in characters, the unit the limit is expressed in
    pub fn len(&self) -> usize {
        self.value.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    fn fit(&self, value: String, policy: LimitPolicy) -> Result<String, ConclaveError> {
        let len = value.chars().count();
        if len <= self.limit {
            return Ok(value);
        }

        match policy {
            LimitPolicy::Reject => Err(ConclaveError::LimitExceeded {
                label: self.label.clone(),
                len,
                limit: self.limit,
            }),
            LimitPolicy::Truncate => {
                warn!(
                    label = %self.label,
                    len,
                    limit = self.limit,
                    "Truncating memory block write"
                );
                Ok(value.chars().take(self.limit).collect())
            }
        }
    }
}

/// All memory blocks of one agent
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: BTreeMap<String, MemoryBlock>,
    policy: LimitPolicy,
}

impl MemoryBlockStore {
    pub fn new(policy: LimitPolicy) -> Self {
        Self {
            blocks: BTreeMap::new(),
            policy,
        }
    }

    pub fn with_blocks(blocks: impl IntoIterator<Item = MemoryBlock>, policy: LimitPolicy) -> Self {
        let mut store = Self::new(policy);
        for block in blocks {
            store.insert(block);
        }
        store
    }

    /// Add or replace a block definition
    pub fn insert(&mut self, block: MemoryBlock) {
        self.blocks.insert(block.label.clone(), block);
    }

    pub fn policy(&self) -> LimitPolicy {
        self.policy
    }

    /// Current value of a block
    pub fn get(&self, label: &str) -> Result<&str, ConclaveError> {
        self.block(label).map(MemoryBlock::value)
    }

    pub fn block(&self, label: &str) -> Result<&MemoryBlock, ConclaveError> {
        self.blocks
            .get(label)
            .ok_or_else(|| ConclaveError::BlockNotFound(label.to_string()))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.blocks.contains_key(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.values()
    }

    /// Replace every literal occurrence of `old` with `new`
    ///
    /// `old` must occur in the block. An empty `old` is only accepted on an
    /// empty block, where it acts as the first write. An empty `new` deletes
    /// the matched text. Returns the new value.
    pub fn replace(&mut self, label: &str, old: &str, new: &str) -> Result<&str, ConclaveError> {
        let policy = self.policy;
        let block = self.writable(label)?;

        let current = block.value.as_str();
        let found = if old.is_empty() {
            current.is_empty()
        } else {
            current.contains(old)
        };
        if !found {
            return Err(ConclaveError::NotFound {
                label: label.to_string(),
                old: old.to_string(),
            });
        }

        let replaced = if old.is_empty() {
            new.to_string()
        } else {
            current.replace(old, new)
        };
        block.value = block.fit(replaced, policy)?;

        debug!(label, len = block.len(), "Replaced memory block content");
        Ok(&block.value)
    }

    /// Overwrite a block's whole value
    pub fn set(&mut self, label: &str, value: impl Into<String>) -> Result<&str, ConclaveError> {
        let policy = self.policy;
        let block = self.writable(label)?;
        block.value = block.fit(value.into(), policy)?;
        Ok(&block.value)
    }

    /// Empty a block
    pub fn clear(&mut self, label: &str) -> Result<(), ConclaveError> {
        self.writable(label)?.value.clear();
        Ok(())
    }

    /// Write a value into a block regardless of `read_only`
    ///
    /// Used by the host to mirror a block owned by another agent. The limit
    /// still applies.
    pub fn mirror(&mut self, label: &str, value: impl Into<String>) -> Result<(), ConclaveError> {
        let policy = self.policy;
        let block = self
            .blocks
            .get_mut(label)
            .ok_or_else(|| ConclaveError::BlockNotFound(label.to_string()))?;
        block.value = block.fit(value.into(), policy)?;
        Ok(())
    }

    fn writable(&mut self, label: &str) -> Result<&mut MemoryBlock, ConclaveError> {
        let block = self
            .blocks
            .get_mut(label)
            .ok_or_else(|| ConclaveError::BlockNotFound(label.to_string()))?;
        if block.read_only {
            return Err(ConclaveError::ReadOnlyBlock(label.to_string()));
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(policy: LimitPolicy) -> MemoryBlockStore {
        MemoryBlockStore::with_blocks(
            [
                MemoryBlock::new("notes", 32),
                MemoryBlock::new("user_projects", 32).read_only(),
            ],
            policy,
        )
    }

    #[test]
    fn test_write_within_limit() {
        let mut store = store(LimitPolicy::Reject);
        let value = "a".repeat(32);
        assert_eq!(store.set("notes", value.clone()).unwrap(), value);
    }

    #[test]
    fn test_reject_over_limit_leaves_block_untouched() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "keep me").unwrap();

        let err = store.set("notes", "b".repeat(33)).unwrap_err();
        assert!(matches!(err, ConclaveError::LimitExceeded { len: 33, limit: 32, .. }));
        assert_eq!(store.get("notes").unwrap(), "keep me");
    }

    #[test]
    fn test_truncate_over_limit() {
        let mut store = store(LimitPolicy::Truncate);
        let written = store.set("notes", "c".repeat(40)).unwrap().to_string();
        assert_eq!(written.chars().count(), 32);
    }

    #[test]
    fn test_limit_counts_characters_not_bytes() {
        let mut store = store(LimitPolicy::Reject);
        // 32 characters, 96 bytes
        let value = "✓".repeat(32);
        assert!(store.set("notes", value).is_ok());
    }

    #[test]
    fn test_replace_missing_is_not_found() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "alpha beta").unwrap();
        let err = store.replace("notes", "gamma", "delta").unwrap_err();
        assert!(matches!(err, ConclaveError::NotFound { .. }));
    }

    #[test]
    fn test_replace_on_empty_block_is_not_found() {
        let mut store = store(LimitPolicy::Reject);
        let err = store.replace("notes", "alpha", "beta").unwrap_err();
        assert!(matches!(err, ConclaveError::NotFound { .. }));
    }

    #[test]
    fn test_empty_old_is_first_write_only() {
        let mut store = store(LimitPolicy::Reject);
        assert_eq!(store.replace("notes", "", "first").unwrap(), "first");
        assert!(store.replace("notes", "", "second").is_err());
    }

    #[test]
    fn test_replace_round_trip() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "buy milk; call Ana").unwrap();

        store.replace("notes", "call Ana", "email Bo").unwrap();
        assert_eq!(store.get("notes").unwrap(), "buy milk; email Bo");

        store.replace("notes", "email Bo", "call Ana").unwrap();
        assert_eq!(store.get("notes").unwrap(), "buy milk; call Ana");
    }

    #[test]
    fn test_replace_applies_to_every_occurrence() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "x-y-x").unwrap();
        assert_eq!(store.replace("notes", "x", "z").unwrap(), "z-y-z");
    }

    #[test]
    fn test_replace_is_literal() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "a.c abc").unwrap();
        assert_eq!(store.replace("notes", "a.c", "_").unwrap(), "_ abc");
    }

    #[test]
    fn test_replace_with_empty_deletes_and_clears() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "one two").unwrap();
        assert_eq!(store.replace("notes", " two", "").unwrap(), "one");
        assert_eq!(store.replace("notes", "one", "").unwrap(), "");
    }

    #[test]
    fn test_replace_over_limit_rejected() {
        let mut store = store(LimitPolicy::Reject);
        store.set("notes", "short").unwrap();
        let err = store.replace("notes", "short", &"long".repeat(10)).unwrap_err();
        assert!(matches!(err, ConclaveError::LimitExceeded { .. }));
        assert_eq!(store.get("notes").unwrap(), "short");
    }

    #[test]
    fn test_read_only_blocks_reject_writes_but_accept_mirror() {
        let mut store = store(LimitPolicy::Reject);
        let err = store.set("user_projects", "x").unwrap_err();
        assert!(matches!(err, ConclaveError::ReadOnlyBlock(_)));

        store.mirror("user_projects", "Website redesign").unwrap();
        assert_eq!(store.get("user_projects").unwrap(), "Website redesign");
    }

    #[test]
    fn test_unknown_block() {
        let store = store(LimitPolicy::Reject);
        assert!(matches!(store.get("nope"), Err(ConclaveError::BlockNotFound(_))));
    }
}
