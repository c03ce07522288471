// Reference table
//
// Maps the 64-bit object IDs handed to the debugger onto runtime objects. Each
// exported object gets one sequence number for as long as it stays in the
// table; the number, not the object identity, is the durable handle.

use crate::protocol::ErrorCode;
use crate::runtime::Runtime;
use crate::types::{ObjectId, ObjectRef};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Pass to `release` to drop every outstanding reference at once.
pub const ALL_REFS: i32 = -1;

/// How a table entry holds its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// Does not keep the object alive.
    Weak,
    /// Registered as a GC root; the object cannot be collected.
    Strong,
    /// The object is gone; the entry is about to be dropped.
    Collected,
}

#[derive(Debug)]
struct RefNode {
    object: ObjectRef,
    strength: Strength,
    count: i64,
}

impl RefNode {
    fn is_collected(&mut self, runtime: &dyn Runtime) -> bool {
        match self.strength {
            Strength::Strong => false,
            Strength::Collected => true,
            Strength::Weak => {
                if runtime.is_collected(self.object) {
                    self.strength = Strength::Collected;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// The table contents, reachable only through the reference-table lock.
#[derive(Debug)]
pub struct RefStore {
    by_id: HashMap<ObjectId, RefNode>,
    by_object: HashMap<ObjectRef, ObjectId>,
    next_seq: ObjectId,
}

impl Default for RefStore {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_object: HashMap::new(),
            next_seq: 1,
        }
    }
}

impl RefStore {
    /// Export an object. Repeated exports of the same object return the same
    /// id and bump its reference count.
    pub fn ref_to_id(&mut self, object: ObjectRef) -> ObjectId {
        if let Some(&id) = self.by_object.get(&object) {
            if let Some(node) = self.by_id.get_mut(&id) {
                node.count += 1;
                return id;
            }
        }
        let id = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(
            id,
            RefNode {
                object,
                strength: Strength::Weak,
                count: 1,
            },
        );
        self.by_object.insert(object, id);
        id
    }

    /// Resolve an id. An entry whose object has been collected is deleted on
    /// the spot and reported as `None`.
    pub fn id_to_ref(&mut self, runtime: &dyn Runtime, id: ObjectId) -> Option<ObjectRef> {
        let node = self.by_id.get_mut(&id)?;
        if node.is_collected(runtime) {
            debug!(id, "dropping collected reference on lookup");
            self.delete(runtime, id);
            return None;
        }
        Some(node.object)
    }

    /// Prevent the object behind `id` from being collected.
    pub fn pin(&mut self, runtime: &dyn Runtime, id: ObjectId) -> Result<(), ErrorCode> {
        let node = self.by_id.get_mut(&id).ok_or(ErrorCode::InvalidObject)?;
        match node.strength {
            Strength::Strong => Ok(()),
            Strength::Collected => {
                self.delete(runtime, id);
                Err(ErrorCode::InvalidObject)
            }
            Strength::Weak => match runtime.add_gc_root(node.object) {
                Ok(()) => {
                    node.strength = Strength::Strong;
                    Ok(())
                }
                Err(_) => {
                    self.delete(runtime, id);
                    Err(ErrorCode::InvalidObject)
                }
            },
        }
    }

    /// Undo `pin`; the entry goes back to holding its object weakly.
    pub fn unpin(&mut self, runtime: &dyn Runtime, id: ObjectId) -> Result<(), ErrorCode> {
        let node = self.by_id.get_mut(&id).ok_or(ErrorCode::InvalidObject)?;
        if node.strength == Strength::Strong {
            runtime.remove_gc_root(node.object);
            node.strength = Strength::Weak;
        }
        Ok(())
    }

    /// Drop `count` references (or all of them with `ALL_REFS`); the entry is
    /// freed once none remain. Unknown ids and other non-positive counts are
    /// ignored.
    pub fn release(&mut self, runtime: &dyn Runtime, id: ObjectId, count: i32) {
        let Some(node) = self.by_id.get_mut(&id) else {
            return;
        };
        match count {
            ALL_REFS => node.count = 0,
            n if n > 0 => node.count -= i64::from(n),
            _ => return,
        }
        if node.count <= 0 {
            self.delete(runtime, id);
        }
    }

    /// Sweep out every entry whose object has been collected.
    pub fn compact(&mut self, runtime: &dyn Runtime) -> usize {
        // Pass one: detach collected nodes from the id index and mark them.
        let mut marked = Vec::new();
        self.by_id.retain(|_, node| {
            if node.is_collected(runtime) {
                node.count = 0;
                marked.push(node.object);
                false
            } else {
                true
            }
        });
        // Pass two: the marks tell us which identity entries to drop.
        for object in &marked {
            self.by_object.remove(object);
        }
        if !marked.is_empty() {
            debug!(freed = marked.len(), "compacted reference table");
        }
        marked.len()
    }

    /// Whether the object behind `id` has been collected.
    pub fn is_collected(&mut self, runtime: &dyn Runtime, id: ObjectId) -> Result<bool, ErrorCode> {
        let node = self.by_id.get_mut(&id).ok_or(ErrorCode::InvalidObject)?;
        Ok(node.is_collected(runtime))
    }

    pub fn count(&self, id: ObjectId) -> Option<i64> {
        self.by_id.get(&id).map(|n| n.count)
    }

    pub fn strength(&self, id: ObjectId) -> Option<Strength> {
        self.by_id.get(&id).map(|n| n.strength)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Forget everything and restart numbering at 1.
    pub fn reset(&mut self, runtime: &dyn Runtime) {
        for node in self.by_id.values() {
            if node.strength == Strength::Strong {
                runtime.remove_gc_root(node.object);
            }
        }
        self.by_id.clear();
        self.by_object.clear();
        self.next_seq = 1;
    }

    fn delete(&mut self, runtime: &dyn Runtime, id: ObjectId) {
        if let Some(node) = self.by_id.remove(&id) {
            if node.strength == Strength::Strong {
                runtime.remove_gc_root(node.object);
            }
            if self.by_object.get(&node.object) == Some(&id) {
                self.by_object.remove(&node.object);
            }
        }
    }
}

/// The reference table with its lock.
pub struct RefTable {
    runtime: Arc<dyn Runtime>,
    store: Mutex<RefStore>,
}

impl RefTable {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            store: Mutex::new(RefStore::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RefStore> {
        self.store.lock()
    }

    pub fn ref_to_id(&self, object: ObjectRef) -> ObjectId {
        self.store.lock().ref_to_id(object)
    }

    pub fn id_to_ref(&self, id: ObjectId) -> Option<ObjectRef> {
        self.store.lock().id_to_ref(&*self.runtime, id)
    }

    pub fn pin(&self, id: ObjectId) -> Result<(), ErrorCode> {
        self.store.lock().pin(&*self.runtime, id)
    }

    pub fn unpin(&self, id: ObjectId) -> Result<(), ErrorCode> {
        self.store.lock().unpin(&*self.runtime, id)
    }

    pub fn release(&self, id: ObjectId, count: i32) {
        self.store.lock().release(&*self.runtime, id, count)
    }

    pub fn compact(&self) -> usize {
        self.store.lock().compact(&*self.runtime)
    }

    pub fn is_collected(&self, id: ObjectId) -> Result<bool, ErrorCode> {
        self.store.lock().is_collected(&*self.runtime, id)
    }

    pub fn count(&self, id: ObjectId) -> Option<i64> {
        self.store.lock().count(id)
    }

    pub fn reset(&self) {
        self.store.lock().reset(&*self.runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedVm;

    fn table() -> (Arc<SimulatedVm>, RefTable) {
        let vm = Arc::new(SimulatedVm::new());
        let table = RefTable::new(vm.clone());
        (vm, table)
    }

    #[test]
    fn test_ref_to_id_is_idempotent() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");

        let first = table.ref_to_id(obj);
        let second = table.ref_to_id(obj);

        assert_eq!(first, second);
        assert_eq!(first, 1);
        assert_eq!(table.count(first), Some(2));
        assert_eq!(table.id_to_ref(first), Some(obj));
    }

    #[test]
    fn test_two_exports_need_two_releases() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = table.ref_to_id(obj);
        table.ref_to_id(obj);

        table.release(id, 1);
        assert_eq!(table.id_to_ref(id), Some(obj));

        table.release(id, 1);
        assert_eq!(table.id_to_ref(id), None);
        assert_eq!(table.count(id), None);
    }

    #[test]
    fn test_release_all_refs() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = table.ref_to_id(obj);
        table.ref_to_id(obj);
        table.ref_to_id(obj);

        table.release(id, ALL_REFS);
        assert_eq!(table.count(id), None);
    }

    #[test]
    fn test_non_positive_release_keeps_count() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = table.ref_to_id(obj);
        table.ref_to_id(obj);

        table.release(id, -5);
        table.release(id, 0);
        assert_eq!(table.count(id), Some(2));
        assert_eq!(table.id_to_ref(id), Some(obj));
    }

    #[test]
    fn test_sequence_number_survives_slot_reuse() {
        let (vm, table) = table();
        let old = vm.new_object("Ljava/lang/Object;");
        let old_id = table.ref_to_id(old);

        vm.collect(old);
        let reused = vm.new_object("Ljava/lang/String;");
        assert_eq!(reused.slot(), old.slot());

        let new_id = table.ref_to_id(reused);
        assert_ne!(old_id, new_id);
        assert_eq!(table.id_to_ref(old_id), None);
        assert_eq!(table.id_to_ref(new_id), Some(reused));
    }

    #[test]
    fn test_lookup_self_heals_collected_entry() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = table.ref_to_id(obj);
        vm.collect(obj);

        assert_eq!(table.id_to_ref(id), None);
        assert_eq!(table.lock().len(), 0);
    }

    #[test]
    fn test_pin_keeps_object_alive() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = table.ref_to_id(obj);

        table.pin(id).unwrap();
        assert_eq!(table.lock().strength(id), Some(Strength::Strong));
        assert!(!vm.collect(obj));
        assert_eq!(table.id_to_ref(id), Some(obj));

        table.unpin(id).unwrap();
        assert_eq!(table.lock().strength(id), Some(Strength::Weak));
        assert!(vm.collect(obj));
        assert_eq!(table.id_to_ref(id), None);
    }

    #[test]
    fn test_pin_collected_object_fails() {
        let (vm, table) = table();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = table.ref_to_id(obj);
        vm.collect(obj);

        assert_eq!(table.pin(id), Err(ErrorCode::InvalidObject));
        assert_eq!(table.count(id), None);
        assert_eq!(table.pin(999), Err(ErrorCode::InvalidObject));
    }

    #[test]
    fn test_compact_removes_only_collected() {
        let (vm, table) = table();
        let live = vm.new_object("Ljava/lang/Object;");
        let dead = vm.new_object("Ljava/lang/Object;");
        let pinned = vm.new_object("Ljava/lang/Object;");
        let live_id = table.ref_to_id(live);
        let dead_id = table.ref_to_id(dead);
        let pinned_id = table.ref_to_id(pinned);
        table.pin(pinned_id).unwrap();

        vm.collect(dead);
        assert_eq!(table.compact(), 1);

        let store = table.lock();
        assert_eq!(store.len(), 2);
        assert_eq!(store.count(dead_id), None);
        assert_eq!(store.count(live_id), Some(1));
        assert_eq!(store.count(pinned_id), Some(1));
    }

    #[test]
    fn test_reset_restarts_numbering() {
        let (vm, table) = table();
        let a = vm.new_object("Ljava/lang/Object;");
        let b = vm.new_object("Ljava/lang/Object;");
        table.ref_to_id(a);
        let b_id = table.ref_to_id(b);
        table.pin(b_id).unwrap();

        table.reset();
        assert!(table.lock().is_empty());
        assert!(vm.collect(b));
        assert_eq!(table.ref_to_id(a), 1);
    }
}
