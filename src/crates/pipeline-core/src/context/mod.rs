//! Shared Context Store (component C): a scoped, ACL-guarded key-value
//! store with TTL and per-key versioning.

mod types;

pub use types::{AgentId, ContextConfig, ContextEntry, QueryFilter, Scope};

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::events::{ContextEvent, EventBus};
use crate::value::Value;

struct Inner {
    config: ContextConfig,
    entries: DashMap<String, ContextEntry>,
    acl: DashMap<String, HashSet<AgentId>>,
    events: Arc<EventBus>,
    shutdown: AtomicBool,
}

#[derive(Clone)]
pub struct SharedContextManager(Arc<Inner>);

impl SharedContextManager {
    pub fn new(config: ContextConfig, events: Arc<EventBus>) -> Self {
        Self(Arc::new(Inner {
            config,
            entries: DashMap::new(),
            acl: DashMap::new(),
            events,
            shutdown: AtomicBool::new(false),
        }))
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.0.shutdown.load(Ordering::SeqCst) {
            return Err(PipelineError::Shutdown { what: "shared context store" });
        }
        Ok(())
    }

    /// Creates or replaces `key`. Version increments monotonically when
    /// `config.versioning` is enabled; the in-memory store never retains
    /// previous versions (§4.C).
    pub fn set(
        &self,
        key: impl Into<String>,
        value: Value,
        owner_id: impl Into<AgentId>,
        scope: Scope,
        ttl: Option<Duration>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.check_shutdown()?;
        let key = key.into();
        let owner_id = owner_id.into();

        if !self.0.entries.contains_key(&key) && self.0.entries.len() >= self.0.config.max_entries {
            return Err(PipelineError::overflow("shared context store", self.0.config.max_entries));
        }

        let version = self
            .0
            .entries
            .get(&key)
            .map(|e| if self.0.config.versioning { e.version + 1 } else { e.version })
            .unwrap_or(1);

        let now = std::time::Instant::now();
        let created_at = self.0.entries.get(&key).map(|e| e.created_at).unwrap_or(now);

        self.0.entries.insert(
            key.clone(),
            ContextEntry {
                key: key.clone(),
                value,
                scope,
                owner_id: owner_id.clone(),
                created_at,
                updated_at: now,
                version,
                ttl,
                metadata,
            },
        );

        self.0.events.emit_context(ContextEvent::Set { key, owner_id });
        Ok(())
    }

    fn resolve_access(&self, entry: &ContextEntry, requester_id: &str, pipeline_id: Option<&str>) -> bool {
        if entry.owner_id == requester_id {
            return true;
        }
        match entry.scope {
            Scope::Global => true,
            Scope::Private => false,
            Scope::Shared => self.0.acl.get(&entry.key).map(|acl| acl.contains(requester_id)).unwrap_or(false),
            Scope::Pipeline => match (pipeline_id, entry.pipeline_id()) {
                (Some(requested), Some(owned)) => requested == owned,
                _ => false,
            },
        }
    }

    /// Returns `Ok(None)` for an absent or lazily-expired key, `Ok(Some(_))`
    /// on success, `Err(AccessDenied)` if the ACL rejects the requester.
    pub fn get(&self, key: &str, requester_id: &str, pipeline_id: Option<&str>) -> Result<Option<Value>> {
        self.check_shutdown()?;

        let expired = match self.0.entries.get(key) {
            Some(entry) => entry.is_expired(),
            None => return Ok(None),
        };
        if expired {
            self.0.entries.remove(key);
            self.0.acl.remove(key);
            self.0.events.emit_context(ContextEvent::Expired { key: key.to_string() });
            return Ok(None);
        }

        let entry = self.0.entries.get(key).expect("checked above");
        if !self.resolve_access(&entry, requester_id, pipeline_id) {
            return Err(PipelineError::access_denied(requester_id, "get", key));
        }
        let value = entry.value.clone();
        drop(entry);

        self.0.events.emit_context(ContextEvent::Get {
            key: key.to_string(),
            requester_id: requester_id.to_string(),
        });
        Ok(Some(value))
    }

    /// Only the owner may delete. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str, requester_id: &str) -> Result<bool> {
        self.check_shutdown()?;
        let Some(entry) = self.0.entries.get(key) else {
            return Ok(false);
        };
        if entry.owner_id != requester_id {
            return Err(PipelineError::access_denied(requester_id, "delete", key));
        }
        drop(entry);
        self.0.entries.remove(key);
        self.0.acl.remove(key);
        self.0.events.emit_context(ContextEvent::Deleted { key: key.to_string() });
        Ok(true)
    }

    /// Owner-only. Transitions `scope` to SHARED and appends to the ACL set.
    pub fn share(&self, key: &str, owner_id: &str, agent_ids: Vec<AgentId>) -> Result<()> {
        self.check_shutdown()?;
        let mut entry = self
            .0
            .entries
            .get_mut(key)
            .ok_or_else(|| PipelineError::not_found("context entry", key.to_string()))?;
        if entry.owner_id != owner_id {
            return Err(PipelineError::access_denied(owner_id, "share", key));
        }
        entry.scope = Scope::Shared;
        drop(entry);

        self.0
            .acl
            .entry(key.to_string())
            .or_insert_with(HashSet::new)
            .extend(agent_ids.iter().cloned());

        self.0.events.emit_context(ContextEvent::Shared {
            key: key.to_string(),
            agent_ids,
        });
        Ok(())
    }

    /// Returns every non-expired entry `requester_id` may read under
    /// `filter`, scanning at most `max_scan_iterations` entries (§4.C
    /// worst-case scan cap) regardless of how many ultimately match.
    pub fn query(&self, filter: &QueryFilter, requester_id: &str, pipeline_id: Option<&str>) -> Vec<ContextEntry> {
        let mut results = Vec::new();
        let mut expired_keys = Vec::new();

        for (scanned, entry) in self.0.entries.iter().enumerate() {
            if scanned >= self.0.config.max_scan_iterations {
                debug!(scanned, "context query hit max_scan_iterations, truncating");
                break;
            }
            if entry.is_expired() {
                expired_keys.push(entry.key.clone());
                continue;
            }
            if let Some(scope) = filter.scope {
                if entry.scope != scope {
                    continue;
                }
            }
            if let Some(owner) = &filter.owner_id {
                if &entry.owner_id != owner {
                    continue;
                }
            }
            if let Some(prefix) = &filter.prefix {
                if !entry.key.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(pattern) = &filter.pattern {
                if !entry.key.contains(pattern.as_str()) {
                    continue;
                }
            }
            if !self.resolve_access(&entry, requester_id, pipeline_id) {
                continue;
            }
            results.push(entry.clone());
        }

        for key in expired_keys {
            self.0.entries.remove(&key);
            self.0.acl.remove(&key);
            self.0.events.emit_context(ContextEvent::Expired { key });
        }

        results
    }

    pub fn get_entry_count(&self) -> usize {
        self.0.entries.len()
    }

    pub fn get_keys(&self, scope: Option<Scope>) -> Vec<String> {
        self.0
            .entries
            .iter()
            .filter(|e| scope.map(|s| e.scope == s).unwrap_or(true))
            .map(|e| e.key.clone())
            .collect()
    }

    /// Sweeps every expired entry proactively; intended to run on a
    /// `tokio::time::interval` owned by `Runtime`, independent of reads.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self.0.entries.iter().filter(|e| e.is_expired()).map(|e| e.key.clone()).collect();
        for key in &expired {
            self.0.entries.remove(key);
            self.0.acl.remove(key);
            self.0.events.emit_context(ContextEvent::Expired { key: key.clone() });
        }
        expired.len()
    }

    pub fn shutdown(&self) {
        self.0.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SharedContextManager {
        SharedContextManager::new(ContextConfig::default(), Arc::new(EventBus::new()))
    }

    #[test]
    fn s5_private_entry_then_shared_grants_access() {
        let m = manager();
        m.set("k", Value::from("v"), "agent1", Scope::Private, None, BTreeMap::new()).unwrap();

        assert!(matches!(m.get("k", "agent2", None), Err(PipelineError::AccessDenied { .. })));

        m.share("k", "agent1", vec!["agent2".to_string()]).unwrap();
        assert_eq!(m.get("k", "agent2", None).unwrap(), Some(Value::from("v")));
        assert!(matches!(m.get("k", "agent3", None), Err(PipelineError::AccessDenied { .. })));
    }

    #[test]
    fn owner_always_has_access_regardless_of_scope() {
        let m = manager();
        m.set("k", Value::Null, "agent1", Scope::Private, None, BTreeMap::new()).unwrap();
        assert_eq!(m.get("k", "agent1", None).unwrap(), Some(Value::Null));
    }

    #[test]
    fn global_scope_is_readable_by_anyone() {
        let m = manager();
        m.set("k", Value::from(1.0), "agent1", Scope::Global, None, BTreeMap::new()).unwrap();
        assert!(m.get("k", "whoever", None).unwrap().is_some());
    }

    #[test]
    fn pipeline_scope_requires_matching_pipeline_id_on_both_sides() {
        let m = manager();
        let mut meta = BTreeMap::new();
        meta.insert("pipelineId".to_string(), Value::String("p1".to_string()));
        m.set("k", Value::Null, "agent1", Scope::Pipeline, None, meta).unwrap();

        assert!(m.get("k", "agent2", None).unwrap_err().to_string().contains("access denied"));
        assert!(m.get("k", "agent2", Some("p2")).unwrap_err().to_string().contains("access denied"));
        assert!(m.get("k", "agent2", Some("p1")).unwrap().is_some());
    }

    #[test]
    fn only_owner_may_delete() {
        let m = manager();
        m.set("k", Value::Null, "agent1", Scope::Global, None, BTreeMap::new()).unwrap();
        assert!(matches!(m.delete("k", "agent2"), Err(PipelineError::AccessDenied { .. })));
        assert!(m.delete("k", "agent1").unwrap());
        assert!(!m.delete("k", "agent1").unwrap());
    }

    #[test]
    fn expired_entries_are_lazily_removed_on_read() {
        let m = manager();
        m.set("k", Value::Null, "agent1", Scope::Global, Some(Duration::from_millis(1)), BTreeMap::new()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(m.get("k", "agent1", None).unwrap(), None);
        assert_eq!(m.get_entry_count(), 0);
    }

    #[test]
    fn version_increments_monotonically_when_versioning_enabled() {
        let m = manager();
        m.set("k", Value::from(1.0), "agent1", Scope::Global, None, BTreeMap::new()).unwrap();
        m.set("k", Value::from(2.0), "agent1", Scope::Global, None, BTreeMap::new()).unwrap();
        let entries = m.query(&QueryFilter::default(), "agent1", None);
        assert_eq!(entries[0].version, 2);
    }

    #[test]
    fn set_rejects_when_store_is_full() {
        let m = SharedContextManager::new(ContextConfig { max_entries: 1, ..ContextConfig::default() }, Arc::new(EventBus::new()));
        m.set("a", Value::Null, "agent1", Scope::Global, None, BTreeMap::new()).unwrap();
        let err = m.set("b", Value::Null, "agent1", Scope::Global, None, BTreeMap::new());
        assert!(matches!(err, Err(PipelineError::Overflow { .. })));
        // Replacing the existing key still succeeds even while full.
        assert!(m.set("a", Value::from(2.0), "agent1", Scope::Global, None, BTreeMap::new()).is_ok());
    }

    #[test]
    fn query_filters_by_prefix_and_owner() {
        let m = manager();
        m.set("ns:a", Value::Null, "agent1", Scope::Global, None, BTreeMap::new()).unwrap();
        m.set("ns:b", Value::Null, "agent2", Scope::Global, None, BTreeMap::new()).unwrap();
        m.set("other", Value::Null, "agent1", Scope::Global, None, BTreeMap::new()).unwrap();

        let filter = QueryFilter { prefix: Some("ns:".to_string()), owner_id: Some("agent1".to_string()), ..Default::default() };
        let results = m.query(&filter, "agent1", None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "ns:a");
    }
}
