//! Live and recently stopped service instances

use crate::{Error, Result};
use process_kernel::{IdAllocator, ProcessRecord};
use service_registry::ServiceInstance;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Instance table owned by the orchestrator
///
/// Live instances are keyed by instance id. Stopped instances move to a
/// bounded history, oldest evicted first.
#[derive(Debug)]
pub struct Instances {
    live: HashMap<u32, ServiceInstance>,
    stopped: VecDeque<ServiceInstance>,
    reserved: HashSet<u32>,
    last_stopped: HashMap<u32, Instant>,
    allocator: IdAllocator,
    retain: usize,
}

impl Instances {
    /// Create an empty table keeping up to `retain` stopped records
    pub fn new(retain: usize) -> Self {
        Self::with_allocator(retain, IdAllocator::new())
    }

    /// Create an empty table drawing instance ids from `allocator`
    pub fn with_allocator(retain: usize, allocator: IdAllocator) -> Self {
        Self {
            live: HashMap::new(),
            stopped: VecDeque::new(),
            reserved: HashSet::new(),
            last_stopped: HashMap::new(),
            allocator,
            retain,
        }
    }

    fn in_use(&self, id: u32) -> bool {
        self.live.contains_key(&id)
            || self.reserved.contains(&id)
            || self.stopped.iter().any(|i| i.id == id)
    }

    fn allocate(&mut self) -> Result<u32> {
        let id = {
            let (live, reserved, stopped) = (&self.live, &self.reserved, &self.stopped);
            self.allocator.allocate_with(|id| {
                live.contains_key(&id) || reserved.contains(&id) || stopped.iter().any(|i| i.id == id)
            })
        };
        if id == 0 {
            return Err(Error::Kernel(process_kernel::Error::internal(
                "instance id space exhausted",
            )));
        }
        Ok(id)
    }

    /// Reserve an id for a later start
    pub fn reserve(&mut self) -> Result<u32> {
        let id = self.allocate()?;
        self.reserved.insert(id);
        Ok(id)
    }

    /// Turn a start request's id into a usable id
    ///
    /// 0 allocates a fresh id; anything else must have been reserved.
    pub fn claim(&mut self, id: u32) -> Result<u32> {
        if id == 0 {
            return self.allocate();
        }
        if self.reserved.remove(&id) {
            Ok(id)
        } else if self.in_use(id) {
            Err(Error::BadParameter(format!("instance id {id} is in use")))
        } else {
            Err(Error::BadParameter(format!("instance id {id} was not reserved")))
        }
    }

    /// Return a claimed reservation after a start that did not happen
    pub fn unclaim(&mut self, id: u32) {
        if id != 0 && !self.live.contains_key(&id) {
            self.reserved.insert(id);
        }
    }

    /// Record a newly started instance
    pub fn insert(&mut self, instance: ServiceInstance) {
        self.live.insert(instance.id, instance);
    }

    /// Live instances of service `sid`
    pub fn live_for(&self, sid: u32) -> Vec<ServiceInstance> {
        let mut instances: Vec<_> = self.live.values().filter(|i| i.sid == sid).cloned().collect();
        instances.sort_by_key(|i| i.id);
        instances
    }

    /// Number of live instances of service `sid`
    pub fn live_count(&self, sid: u32) -> usize {
        self.live.values().filter(|i| i.sid == sid).count()
    }

    /// Look up an instance, live or stopped
    pub fn get(&self, id: u32) -> Option<ServiceInstance> {
        self.live
            .get(&id)
            .or_else(|| self.stopped.iter().find(|i| i.id == id))
            .cloned()
    }

    /// Every instance, live and stopped, sorted by id
    pub fn list(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<_> = self.live.values().chain(self.stopped.iter()).cloned().collect();
        all.sort_by_key(|i| i.id);
        all
    }

    /// Fold a kernel snapshot into the live instance it belongs to
    ///
    /// Returns the updated instance, or `None` if no live instance runs that
    /// process. A terminal snapshot moves the instance to the history.
    pub fn apply(&mut self, record: &ProcessRecord) -> Option<ServiceInstance> {
        let id = self
            .live
            .values()
            .find(|i| i.process_id == record.id)
            .map(|i| i.id)?;
        let instance = self.live.get_mut(&id)?;
        instance.apply_record(record);
        let updated = instance.clone();

        if !updated.is_live() {
            self.live.remove(&id);
            self.last_stopped.insert(updated.sid, Instant::now());
            self.stopped.push_back(updated.clone());
            while self.stopped.len() > self.retain {
                self.stopped.pop_front();
            }
        }
        Some(updated)
    }

    /// Returns true once `idle` has passed since service `sid` last stopped
    pub fn idle_elapsed(&self, sid: u32, idle: Duration) -> bool {
        self.last_stopped
            .get(&sid)
            .is_none_or(|stopped| stopped.elapsed() >= idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use process_kernel::{ProcessState, Tuples};
    use service_registry::ServiceDefinition;
    use std::path::PathBuf;

    fn service(sid: u32) -> ServiceDefinition {
        ServiceDefinition {
            sid,
            ..ServiceDefinition::new("web", "web")
        }
    }

    fn record(process_id: u32, state: ProcessState) -> ProcessRecord {
        ProcessRecord {
            id: process_id,
            sid: 1,
            name: "web".to_string(),
            path: PathBuf::from("/srv/web"),
            pid: Some(4000),
            state,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            signal: None,
            error: None,
        }
    }

    #[test]
    fn test_reserve_and_claim() {
        let mut instances = Instances::with_allocator(8, IdAllocator::seeded(1));
        let id = instances.reserve().unwrap();
        assert_ne!(id, 0);
        assert_eq!(instances.claim(id).unwrap(), id);
        assert!(matches!(instances.claim(id), Err(Error::BadParameter(_))));
        instances.unclaim(id);
        assert_eq!(instances.claim(id).unwrap(), id);
        assert_ne!(instances.claim(0).unwrap(), 0);
    }

    #[test]
    fn test_terminal_record_moves_to_history() {
        let mut instances = Instances::with_allocator(2, IdAllocator::seeded(2));
        let svc = service(1);
        instances.insert(ServiceInstance::new(10, 100, &svc, Tuples::new(), Tuples::new()));
        assert_eq!(instances.live_count(1), 1);
        assert!(instances.idle_elapsed(1, Duration::from_secs(3600)));

        let running = instances.apply(&record(100, ProcessState::Running)).unwrap();
        assert_eq!(running.state, ProcessState::Running);
        assert!(instances.apply(&record(999, ProcessState::Running)).is_none());

        let stopped = instances.apply(&record(100, ProcessState::Stopped)).unwrap();
        assert!(!stopped.is_live());
        assert_eq!(instances.live_count(1), 0);
        assert_eq!(instances.get(10).unwrap().state, ProcessState::Stopped);
        assert!(!instances.idle_elapsed(1, Duration::from_secs(3600)));
        assert!(instances.idle_elapsed(1, Duration::ZERO));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut instances = Instances::with_allocator(2, IdAllocator::seeded(3));
        let svc = service(1);
        for id in 1..=3 {
            instances.insert(ServiceInstance::new(id, id + 100, &svc, Tuples::new(), Tuples::new()));
            instances.apply(&record(id + 100, ProcessState::Stopped));
        }
        let ids: Vec<_> = instances.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
