use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::entity::SpatialEntity;

/// Rendering-side consumer of decoded entities, addressed by named
/// collection (one per region, one per tile).
pub trait EntitySink: Send + Sync {
    /// Replaces the collection's contents.
    fn replace(&self, collection: &str, entities: &[SpatialEntity]);

    fn append(&self, collection: &str, entities: &[SpatialEntity]);

    fn set_visible(&self, collection: &str, visible: bool);

    fn remove(&self, collection: &str);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkCollection {
    pub entities: Vec<SpatialEntity>,
    pub visible: bool,
    /// Number of `replace`/`append` calls that delivered entities.
    pub batches: usize,
}

/// Sink that keeps everything in memory; backs headless sessions and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    collections: Mutex<BTreeMap<String, SinkCollection>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<SinkCollection> {
        self.collections.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.lock().keys().cloned().collect()
    }

    pub fn visible_names(&self) -> Vec<String> {
        self.collections
            .lock()
            .iter()
            .filter(|(_, c)| c.visible)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn entity_count(&self, name: &str) -> usize {
        self.collections
            .lock()
            .get(name)
            .map_or(0, |c| c.entities.len())
    }
}

impl EntitySink for MemorySink {
    fn replace(&self, collection: &str, entities: &[SpatialEntity]) {
        let mut collections = self.collections.lock();
        let c = collections.entry(collection.to_string()).or_default();
        c.entities = entities.to_vec();
        c.visible = true;
        c.batches = 1;
    }

    fn append(&self, collection: &str, entities: &[SpatialEntity]) {
        let mut collections = self.collections.lock();
        let c = collections.entry(collection.to_string()).or_default();
        c.entities.extend_from_slice(entities);
        c.visible = true;
        c.batches += 1;
    }

    fn set_visible(&self, collection: &str, visible: bool) {
        if let Some(c) = self.collections.lock().get_mut(collection) {
            c.visible = visible;
        }
    }

    fn remove(&self, collection: &str) {
        self.collections.lock().remove(collection);
    }
}

#[cfg(test)]
mod tests {
    use super::{EntitySink, MemorySink};

    #[test]
    fn visibility_is_independent_of_contents() {
        let sink = MemorySink::new();
        sink.replace("tile:15/1/2", &[]);
        sink.set_visible("tile:15/1/2", false);
        assert!(sink.collection("tile:15/1/2").is_some());
        assert!(sink.visible_names().is_empty());

        sink.set_visible("tile:15/1/2", true);
        assert_eq!(sink.visible_names(), vec!["tile:15/1/2".to_string()]);

        sink.remove("tile:15/1/2");
        assert!(sink.names().is_empty());
    }
}
