use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::envelope::Envelope;
use crate::util::callback::invoke_guarded;


/// Identifies a registered trigger for later removal
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TriggerId(u64);

type DataCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Clone, Default)]
struct Registry {
    by_data_type: FxHashMap<i32, Vec<(TriggerId, DataCallback)>>,
    catch_all: Vec<(TriggerId, DataCallback)>,
}

/// The data triggers of a session: callbacks keyed by data type, plus catch-all callbacks for
///  every envelope.
///
/// The registry is copy-on-write: dispatch works on an immutable snapshot, so callbacks can add
///  or remove triggers (including themselves) without deadlocking. Changes take effect with the
///  next envelope.
#[derive(Default)]
pub struct DataTriggers {
    next_id: AtomicU64,
    registry: RwLock<Arc<Registry>>,
}

impl DataTriggers {
    pub fn add(&self, data_type: i32, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> TriggerId {
        let id = self.new_id();
        self.update(|registry| {
            registry.by_data_type
                .entry(data_type)
                .or_default()
                .push((id, Arc::new(callback)));
        });
        id
    }

    pub fn add_catch_all(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> TriggerId {
        let id = self.new_id();
        self.update(|registry| registry.catch_all.push((id, Arc::new(callback))));
        id
    }

    /// returns `true` if a trigger was removed
    pub fn remove(&self, id: TriggerId) -> bool {
        self.update(|registry| {
            let num_before = registry.num_triggers();

            registry.catch_all.retain(|(trigger_id, _)| *trigger_id != id);
            for triggers in registry.by_data_type.values_mut() {
                triggers.retain(|(trigger_id, _)| *trigger_id != id);
            }
            registry.by_data_type.retain(|_, triggers| !triggers.is_empty());

            registry.num_triggers() != num_before
        })
    }

    /// removes all triggers for a given data type, returning the number of removed triggers
    pub fn remove_data_type(&self, data_type: i32) -> usize {
        self.update(|registry| {
            registry.by_data_type.remove(&data_type)
                .map(|triggers| triggers.len())
                .unwrap_or(0)
        })
    }

    pub fn len(&self) -> usize {
        self.snapshot().num_triggers()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes the triggers for the envelope's data type in registration order, followed by the
    ///  catch-all triggers. A panicking trigger is logged and does not affect the others.
    pub fn dispatch(&self, envelope: &Envelope) {
        let registry = self.snapshot();

        let type_specific = registry.by_data_type
            .get(&envelope.data_type)
            .map(|triggers| triggers.as_slice())
            .unwrap_or_default();

        if type_specific.is_empty() && registry.catch_all.is_empty() {
            trace!(data_type = envelope.data_type, "no trigger for envelope");
            return;
        }

        for (_, callback) in type_specific.iter().chain(registry.catch_all.iter()) {
            invoke_guarded("data trigger", || callback(envelope));
        }
    }

    fn new_id(&self) -> TriggerId {
        TriggerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn snapshot(&self) -> Arc<Registry> {
        self.registry.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = Registry::clone(&registry);
        let result = f(&mut updated);
        *registry = Arc::new(updated);
        result
    }
}

impl Registry {
    fn num_triggers(&self) -> usize {
        self.catch_all.len() + self.by_data_type.values().map(|t| t.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use rstest::rstest;

    use super::*;

    fn recording_trigger(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl Fn(&Envelope) + Send + Sync + 'static {
        let log = log.clone();
        move |envelope| log.lock().unwrap().push(format!("{}:{}", name, envelope.data_type))
    }

    #[rstest]
    #[case::matching_type(31, vec!["a1:31", "a2:31", "all:31"])]
    #[case::other_type(32, vec!["b:32", "all:32"])]
    #[case::no_type_specific(99, vec!["all:99"])]
    fn test_dispatch_order(#[case] data_type: i32, #[case] expected: Vec<&str>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let triggers = DataTriggers::default();
        triggers.add_catch_all(recording_trigger(&log, "all"));
        triggers.add(31, recording_trigger(&log, "a1"));
        triggers.add(32, recording_trigger(&log, "b"));
        triggers.add(31, recording_trigger(&log, "a2"));

        triggers.dispatch(&Envelope::new(data_type, 0, Vec::<u8>::new()));
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_remove() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let triggers = DataTriggers::default();
        let a = triggers.add(1, recording_trigger(&log, "a"));
        let b = triggers.add(1, recording_trigger(&log, "b"));
        let all = triggers.add_catch_all(recording_trigger(&log, "all"));
        assert_eq!(triggers.len(), 3);

        assert!(triggers.remove(a));
        assert!(!triggers.remove(a));
        triggers.dispatch(&Envelope::new(1, 0, Vec::<u8>::new()));
        assert_eq!(*log.lock().unwrap(), vec!["b:1", "all:1"]);

        assert!(triggers.remove(all));
        assert!(triggers.remove(b));
        assert!(triggers.is_empty());
    }

    #[test]
    fn test_remove_data_type() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let triggers = DataTriggers::default();
        triggers.add(1, recording_trigger(&log, "a"));
        triggers.add(1, recording_trigger(&log, "b"));
        triggers.add(2, recording_trigger(&log, "c"));

        assert_eq!(triggers.remove_data_type(1), 2);
        assert_eq!(triggers.remove_data_type(1), 0);

        triggers.dispatch(&Envelope::new(1, 0, Vec::<u8>::new()));
        triggers.dispatch(&Envelope::new(2, 0, Vec::<u8>::new()));
        assert_eq!(*log.lock().unwrap(), vec!["c:2"]);
    }

    #[test]
    fn test_panicking_trigger_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let triggers = DataTriggers::default();
        triggers.add(1, |_| panic!("trigger failure"));
        triggers.add(1, recording_trigger(&log, "a"));

        triggers.dispatch(&Envelope::new(1, 0, Vec::<u8>::new()));
        triggers.dispatch(&Envelope::new(1, 0, Vec::<u8>::new()));
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "a:1"]);
    }

    #[test]
    fn test_trigger_can_modify_registry() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let triggers = Arc::new(DataTriggers::default());

        let triggers_for_callback = triggers.clone();
        let log_for_callback = log.clone();
        triggers.add(1, move |_| {
            log_for_callback.lock().unwrap().push("self-removing".to_string());
            triggers_for_callback.remove_data_type(1);
        });

        triggers.dispatch(&Envelope::new(1, 0, Vec::<u8>::new()));
        triggers.dispatch(&Envelope::new(1, 0, Vec::<u8>::new()));
        assert_eq!(*log.lock().unwrap(), vec!["self-removing"]);
        assert!(triggers.is_empty());
    }
}
