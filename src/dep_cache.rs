use std::collections::HashMap;

use tracing::trace;

use crate::error::SchedulingError;
use crate::state_machine::{Dependable, JobSpec, ObjectKey, Registry, StatefulObject};
use crate::store::Store;

/// Memoizes dependency lookups for one planning pass. Never shared across
/// passes: the world may change between them.
#[derive(Debug, Default)]
pub struct DepCache {
    objects: HashMap<(ObjectKey, String), Dependable>,
    jobs: HashMap<String, Dependable>,
    pub hits: u64,
    pub misses: u64,
}

impl DepCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static dependencies of `object` while in `state`.
    pub fn object_deps(
        &mut self,
        registry: &Registry,
        store: &dyn Store,
        object: &StatefulObject,
        state: &str,
    ) -> Result<Dependable, SchedulingError> {
        let key = (object.key.clone(), state.to_string());
        if let Some(deps) = self.objects.get(&key) {
            self.hits += 1;
            return Ok(deps.clone());
        }
        self.misses += 1;
        trace!(object = %object.key, state, "computing object deps");
        let deps = registry
            .type_of(&object.key.kind)?
            .get_deps(object, state, store);
        self.objects.insert(key, deps.clone());
        Ok(deps)
    }

    /// Dynamic dependencies of the job `spec` would construct.
    pub fn job_deps(
        &mut self,
        registry: &Registry,
        store: &dyn Store,
        spec: &JobSpec,
    ) -> Result<Dependable, SchedulingError> {
        let key = spec.cache_key();
        if let Some(deps) = self.jobs.get(&key) {
            self.hits += 1;
            return Ok(deps.clone());
        }
        self.misses += 1;
        let deps = registry.job_class(&spec.class_name)?.get_deps(spec, store);
        self.jobs.insert(key, deps.clone());
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::state_machine::{DependOn, StatefulType};
    use crate::store::MemoryStore;

    struct Counting {
        states: Vec<String>,
        calls: Arc<AtomicUsize>,
    }

    impl StatefulType for Counting {
        fn name(&self) -> &str {
            "target"
        }
        fn states(&self) -> &[String] {
            &self.states
        }
        fn initial_state(&self) -> &str {
            "unmounted"
        }
        fn get_deps(&self, _object: &StatefulObject, state: &str, _store: &dyn Store) -> Dependable {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if state == "mounted" {
                DependOn::new(ObjectKey::new("host", 1), "lnet_up").into()
            } else {
                Dependable::none()
            }
        }
    }

    #[test]
    fn object_deps_computed_once_per_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::builder()
            .register_type(Arc::new(Counting {
                states: vec!["unmounted".into(), "mounted".into()],
                calls: calls.clone(),
            }))
            .build()
            .unwrap();
        let store = MemoryStore::new();
        let target = StatefulObject::new(ObjectKey::new("target", 1), "unmounted");

        let mut cache = DepCache::new();
        for _ in 0..3 {
            let deps = cache.object_deps(&registry, &store, &target, "mounted").unwrap();
            assert_eq!(deps.all().len(), 1);
        }
        cache.object_deps(&registry, &store, &target, "unmounted").unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.hits, 2);
        assert_eq!(cache.misses, 2);
    }
}
