//! The Soul Store - per-identity memory, values and persona.
//!
//! Each identity has three attribute groups behind three independent locks:
//! an append-only memory log, a last-write-wins scalar map, and a persona
//! replaced wholesale. A writer on one group never blocks a reader on
//! another. Identities are created on first write; reads of an unknown
//! identity see empty state.

use crate::event::{Event, EventPayload, SoulEvent};
use crate::event_bus::EventBus;
use matrix_env::{ByteStore, EnvError, NodeContext};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// One immutable entry in a soul's memory log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub content: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub tags: Vec<String>,
}

impl MemoryEntry {
    pub fn new(timestamp: i64, content: impl Into<String>, entry_type: impl Into<String>) -> Self {
        Self {
            timestamp,
            content: content.into(),
            entry_type: entry_type.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// True if any of this entry's tags is in `wanted`.
    fn matches_any(&self, wanted: &HashSet<&str>) -> bool {
        self.tags.iter().any(|tag| wanted.contains(tag.as_str()))
    }
}

/// A soul's personality: trait weights plus goals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub traits: HashMap<String, f64>,
    pub goals: Vec<String>,
}

#[derive(Default)]
struct Soul {
    memory: RwLock<Vec<MemoryEntry>>,
    values: RwLock<HashMap<String, f64>>,
    persona: RwLock<Persona>,
}

/// Serialized form used by [`SoulStore::persist`].
#[derive(Serialize, Deserialize)]
struct SoulRecord {
    memory: Vec<MemoryEntry>,
    values: HashMap<String, f64>,
    persona: Persona,
}

/// Concurrency-safe holder of every soul's state, keyed by identity.
#[derive(Default)]
pub struct SoulStore {
    souls: RwLock<HashMap<String, Arc<Soul>>>,
    events: Option<(EventBus, Arc<dyn NodeContext>)>,
}

impl SoulStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a [`SoulEvent`] on `bus` after every mutation.
    pub fn with_events(mut self, bus: EventBus, context: Arc<dyn NodeContext>) -> Self {
        self.events = Some((bus, context));
        self
    }

    fn soul(&self, id: &str) -> Option<Arc<Soul>> {
        self.souls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn soul_or_create(&self, id: &str) -> Arc<Soul> {
        if let Some(soul) = self.soul(id) {
            return soul;
        }
        let mut souls = self.souls.write().unwrap_or_else(PoisonError::into_inner);
        souls.entry(id.to_string()).or_default().clone()
    }

    fn emit(&self, id: &str, event: SoulEvent) {
        if let Some((bus, context)) = &self.events {
            bus.publish(Event::new(id, context.unix_millis(), EventPayload::Soul(event)));
        }
    }

    // ---- Memory ------------------------------------------------------------

    /// Appends `entry` to the memory log of `id`.
    pub fn add_memory(&self, id: &str, entry: MemoryEntry) {
        let entry_type = entry.entry_type.clone();
        let soul = self.soul_or_create(id);
        soul.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        self.emit(
            id,
            SoulEvent::MemoryAdded {
                soul_id: id.to_string(),
                entry_type,
            },
        );
    }

    /// Returns memories of `id` in append order.
    ///
    /// With empty `tags`, every entry. Otherwise the entries carrying at
    /// least one of `tags`.
    pub fn get_memories(&self, id: &str, tags: &[&str]) -> Vec<MemoryEntry> {
        let Some(soul) = self.soul(id) else {
            return Vec::new();
        };
        let memory = soul.memory.read().unwrap_or_else(PoisonError::into_inner);
        if tags.is_empty() {
            return memory.clone();
        }
        let wanted: HashSet<&str> = tags.iter().copied().collect();
        memory
            .iter()
            .filter(|entry| entry.matches_any(&wanted))
            .cloned()
            .collect()
    }

    /// Number of memory entries held for `id`.
    pub fn memory_len(&self, id: &str) -> usize {
        self.soul(id).map_or(0, |soul| {
            soul.memory.read().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    // ---- Values ------------------------------------------------------------

    pub fn set_value(&self, id: &str, key: &str, value: f64) {
        let soul = self.soul_or_create(id);
        soul.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        self.emit(
            id,
            SoulEvent::ValueSet {
                soul_id: id.to_string(),
                key: key.to_string(),
                value,
            },
        );
    }

    /// `None` means the key was never set, which is distinct from `Some(0.0)`.
    pub fn get_value(&self, id: &str, key: &str) -> Option<f64> {
        let soul = self.soul(id)?;
        let values = soul.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(key).copied()
    }

    // ---- Persona -----------------------------------------------------------

    /// Replaces the persona of `id` wholesale.
    pub fn update_persona(&self, id: &str, persona: Persona) {
        let soul = self.soul_or_create(id);
        *soul.persona.write().unwrap_or_else(PoisonError::into_inner) = persona;
        self.emit(
            id,
            SoulEvent::PersonaUpdated {
                soul_id: id.to_string(),
            },
        );
    }

    pub fn get_persona(&self, id: &str) -> Persona {
        self.soul(id)
            .map(|soul| soul.persona.read().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    // ---- Registry ----------------------------------------------------------

    /// Known identities, sorted.
    pub fn ids(&self) -> Vec<String> {
        let souls = self.souls.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = souls.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.souls.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets an identity. Returns true if it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.souls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    // ---- Persistence -------------------------------------------------------

    fn storage_key(id: &str) -> Vec<u8> {
        format!("soul/{}", id).into_bytes()
    }

    /// Writes the full state of `id` to `store` as JSON under `soul/<id>`.
    ///
    /// Each group is read under its own lock, so the record is consistent per
    /// group, not across groups.
    pub fn persist(&self, id: &str, store: &dyn ByteStore) -> Result<(), EnvError> {
        let record = SoulRecord {
            memory: self.get_memories(id, &[]),
            values: self
                .soul(id)
                .map(|soul| soul.values.read().unwrap_or_else(PoisonError::into_inner).clone())
                .unwrap_or_default(),
            persona: self.get_persona(id),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| EnvError::SerializationError(e.to_string()))?;
        store.put(&Self::storage_key(id), &bytes)
    }

    /// Loads `id` from `store`, replacing any in-memory state.
    ///
    /// Returns `Ok(false)` if nothing was stored for `id`.
    pub fn restore(&self, id: &str, store: &dyn ByteStore) -> Result<bool, EnvError> {
        let Some(bytes) = store.get(&Self::storage_key(id))? else {
            return Ok(false);
        };
        let record: SoulRecord = serde_json::from_slice(&bytes)
            .map_err(|e| EnvError::SerializationError(e.to_string()))?;

        let soul = Arc::new(Soul {
            memory: RwLock::new(record.memory),
            values: RwLock::new(record.values),
            persona: RwLock::new(record.persona),
        });
        self.souls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), soul);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use matrix_env::{CancelToken, MemoryStore, TokioContext};
    use proptest::prelude::*;
    use std::thread;

    fn entry(n: i64, tags: &[&str]) -> MemoryEntry {
        MemoryEntry::new(n, format!("memory {}", n), "observation").with_tags(tags.iter().copied())
    }

    #[test]
    fn test_memories_in_append_order() {
        let store = SoulStore::new();
        for i in 0..5 {
            store.add_memory("s1", entry(i, &[]));
        }
        let all = store.get_memories("s1", &[]);
        let stamps: Vec<i64> = all.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_tag_filter_is_any_match() {
        let store = SoulStore::new();
        store.add_memory("s1", entry(0, &["a", "b"]));
        store.add_memory("s1", entry(1, &["b"]));
        store.add_memory("s1", entry(2, &["c"]));
        store.add_memory("s1", entry(3, &[]));

        let hits: Vec<i64> = store
            .get_memories("s1", &["a", "c"])
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(hits, vec![0, 2]);
        assert!(store.get_memories("s1", &["zzz"]).is_empty());
    }

    #[test]
    fn test_value_presence_flag() {
        let store = SoulStore::new();
        assert_eq!(store.get_value("s1", "mood"), None);

        store.set_value("s1", "mood", 0.0);
        assert_eq!(store.get_value("s1", "mood"), Some(0.0));
        assert_eq!(store.get_value("s1", "energy"), None);

        store.set_value("s1", "mood", 0.7);
        assert_eq!(store.get_value("s1", "mood"), Some(0.7));
    }

    #[test]
    fn test_persona_replaced_wholesale() {
        let store = SoulStore::new();
        let mut first = Persona::default();
        first.traits.insert("curious".into(), 0.9);
        first.goals.push("explore".into());
        store.update_persona("s1", first);

        let mut second = Persona::default();
        second.traits.insert("calm".into(), 0.4);
        store.update_persona("s1", second.clone());

        let persona = store.get_persona("s1");
        assert_eq!(persona, second);
        assert!(!persona.traits.contains_key("curious"));
        assert!(persona.goals.is_empty());
    }

    #[test]
    fn test_unknown_identity_reads_are_empty() {
        let store = SoulStore::new();
        assert!(store.get_memories("ghost", &[]).is_empty());
        assert_eq!(store.get_persona("ghost"), Persona::default());
        assert!(store.is_empty(), "reads must not create identities");
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(SoulStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        store.add_memory("shared", entry(t * 1000 + i, &[]));
                        let _ = store.get_value("shared", "x");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let all = store.get_memories("shared", &[]);
        assert_eq!(all.len(), 800);

        // Per-thread order is preserved
        for t in 0..8 {
            let mine: Vec<i64> = all
                .iter()
                .map(|e| e.timestamp)
                .filter(|ts| ts / 1000 == t)
                .collect();
            let mut sorted = mine.clone();
            sorted.sort();
            assert_eq!(mine, sorted);
        }
    }

    #[test]
    fn test_value_read_not_blocked_by_memory_writer() {
        let store = SoulStore::new();
        store.set_value("s1", "k", 1.0);
        let soul = store.soul("s1").unwrap();

        // Hold the memory group exclusively; the value group stays readable.
        let _memory_guard = soul.memory.write().unwrap();
        assert_eq!(store.get_value("s1", "k"), Some(1.0));
        assert_eq!(store.get_persona("s1"), Persona::default());
    }

    #[test]
    fn test_persist_and_restore() {
        let kv = MemoryStore::new();
        let store = SoulStore::new();
        store.add_memory("s1", entry(1, &["x"]));
        store.set_value("s1", "trust", 0.25);
        let mut persona = Persona::default();
        persona.goals.push("survive".into());
        store.update_persona("s1", persona.clone());
        store.persist("s1", &kv).unwrap();

        let fresh = SoulStore::new();
        assert!(fresh.restore("s1", &kv).unwrap());
        assert_eq!(fresh.get_memories("s1", &[]), store.get_memories("s1", &[]));
        assert_eq!(fresh.get_value("s1", "trust"), Some(0.25));
        assert_eq!(fresh.get_persona("s1"), persona);

        assert!(!fresh.restore("missing", &kv).unwrap());
    }

    #[tokio::test]
    async fn test_mutations_publish_soul_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Soul, CancelToken::new());
        let store = SoulStore::new().with_events(bus.clone(), TokioContext::shared());

        store.set_value("s1", "k", 2.0);
        store.add_memory("s1", entry(0, &[]));

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].payload(),
            EventPayload::Soul(SoulEvent::ValueSet { value, .. }) if *value == 2.0
        ));
        assert_eq!(events[1].origin(), "s1");
    }

    proptest! {
        #[test]
        fn prop_full_log_matches_call_order(stamps in prop::collection::vec(any::<i64>(), 0..64)) {
            let store = SoulStore::new();
            for ts in &stamps {
                store.add_memory("p", MemoryEntry::new(*ts, "c", "t"));
            }
            let got: Vec<i64> = store.get_memories("p", &[]).iter().map(|e| e.timestamp).collect();
            prop_assert_eq!(got, stamps);
        }

        #[test]
        fn prop_tag_filter_is_intersection(
            entries in prop::collection::vec(prop::collection::vec(0u8..6, 0..4), 0..32),
            query in prop::collection::vec(0u8..6, 1..4),
        ) {
            let store = SoulStore::new();
            for (i, tags) in entries.iter().enumerate() {
                let tags: Vec<String> = tags.iter().map(|t| format!("t{}", t)).collect();
                store.add_memory("p", MemoryEntry::new(i as i64, "c", "t").with_tags(tags));
            }
            let query: Vec<String> = query.iter().map(|t| format!("t{}", t)).collect();
            let query_refs: Vec<&str> = query.iter().map(String::as_str).collect();

            let got: Vec<i64> = store.get_memories("p", &query_refs).iter().map(|e| e.timestamp).collect();
            let expected: Vec<i64> = entries
                .iter()
                .enumerate()
                .filter(|(_, tags)| tags.iter().any(|t| query.contains(&format!("t{}", t))))
                .map(|(i, _)| i as i64)
                .collect();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn prop_persist_restore_is_exact(
            values in prop::collection::vec(
                prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL | prop::num::f64::ZERO,
                1..16,
            ),
            stamps in prop::collection::vec(any::<i64>(), 0..16),
            weight in prop::num::f64::NORMAL,
        ) {
            let store = SoulStore::new();
            for (i, value) in values.iter().enumerate() {
                store.set_value("p", &format!("k{}", i), *value);
            }
            for ts in &stamps {
                store.add_memory("p", MemoryEntry::new(*ts, "c", "t"));
            }
            let mut persona = Persona::default();
            persona.traits.insert("curiosity".into(), weight);
            store.update_persona("p", persona.clone());

            let kv = MemoryStore::new();
            store.persist("p", &kv).unwrap();
            let restored = SoulStore::new();
            prop_assert!(restored.restore("p", &kv).unwrap());

            for (i, value) in values.iter().enumerate() {
                let got = restored.get_value("p", &format!("k{}", i)).unwrap();
                prop_assert_eq!(got.to_bits(), value.to_bits());
            }
            prop_assert_eq!(restored.get_memories("p", &[]), store.get_memories("p", &[]));
            prop_assert_eq!(restored.get_persona("p"), persona);
        }
    }
}
