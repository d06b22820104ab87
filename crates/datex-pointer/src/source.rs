//! External pointer sources
//!
//! Storage layers and other collaborators register as sources; a local
//! miss consults them in descending priority before going to the network.

use std::sync::Arc;

use parking_lot::RwLock;

use datex_core::{PointerId, Value};

/// Provider of pointer values not held in the registry
pub trait PointerSource: Send + Sync {
    fn fetch(&self, id: &PointerId) -> Option<Value>;
}

/// Shared, priority-ordered source list
#[derive(Clone, Default)]
pub struct PointerSources {
    sources: Arc<RwLock<Vec<(i32, Arc<dyn PointerSource>)>>>,
}

impl PointerSources {
    pub fn new() -> Self {
        PointerSources::default()
    }

    pub fn register(&self, source: Arc<dyn PointerSource>, priority: i32) {
        let mut sources = self.sources.write();
        let at = sources.partition_point(|(p, _)| *p >= priority);
        sources.insert(at, (priority, source));
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// First value any source provides
    pub fn fetch(&self, id: &PointerId) -> Option<Value> {
        self.sources.read().iter().find_map(|(_, s)| s.fetch(id))
    }
}

impl std::fmt::Debug for PointerSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerSources").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Value);

    impl PointerSource for Fixed {
        fn fetch(&self, _id: &PointerId) -> Option<Value> {
            Some(self.0.clone())
        }
    }

    struct Empty;

    impl PointerSource for Empty {
        fn fetch(&self, _id: &PointerId) -> Option<Value> {
            None
        }
    }

    #[test]
    fn test_priority_order() {
        let sources = PointerSources::new();
        sources.register(Arc::new(Fixed(Value::Int(1))), 1);
        sources.register(Arc::new(Fixed(Value::Int(10))), 10);
        sources.register(Arc::new(Empty), 100);
        assert_eq!(sources.len(), 3);
        assert_eq!(sources.fetch(&PointerId::ANONYMOUS), Some(Value::Int(10)));
    }

    #[test]
    fn test_empty_sources() {
        assert_eq!(PointerSources::new().fetch(&PointerId::ANONYMOUS), None);
    }
}
