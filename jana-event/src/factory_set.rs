use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::factory::AnySlot;
use crate::{Error, FactoryStatus, Result, Slot};

/// The factory registry owned by one event: `(object type, tag) → Slot`.
///
/// Populated once by the factory generators when the owning event is
/// created in its pool, then reused for the lifetime of the run; recycling
/// the event resets slot contents but never the registry itself.
#[derive(Default)]
pub struct FactorySet {
    slots: HashMap<TypeId, HashMap<String, Box<dyn AnySlot>>>,
}

impl fmt::Debug for FactorySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactorySet")
            .field("summaries", &self.summaries())
            .finish()
    }
}

impl FactorySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot. Registering a second factory for the same
    /// `(type, tag)` pair is a configuration error.
    pub fn add<T: Send + 'static>(&mut self, slot: Slot<T>) -> Result<()> {
        let by_tag = self.slots.entry(TypeId::of::<T>()).or_default();
        if by_tag.contains_key(AnySlot::tag(&slot)) {
            return Err(Error::Configuration(format!(
                "duplicate factory for object type '{}' with tag '{}'",
                slot.object_type_name(),
                AnySlot::tag(&slot)
            )));
        }
        by_tag.insert(AnySlot::tag(&slot).to_owned(), Box::new(slot));
        Ok(())
    }

    pub(crate) fn slot_of<T: Send + 'static>(&self, tag: &str) -> Option<&Slot<T>> {
        self.slots
            .get(&TypeId::of::<T>())?
            .get(tag)?
            .as_any()
            .downcast_ref::<Slot<T>>()
    }

    /// Stores a collection directly, creating an insert-only slot if no
    /// factory was registered for the pair.
    pub fn insert<T: Send + 'static>(&mut self, items: Vec<T>, tag: &str) {
        let by_tag = self.slots.entry(TypeId::of::<T>()).or_default();
        let slot = by_tag.entry(tag.to_owned()).or_insert_with(|| {
            Box::new(Slot::<T>::insert_only().tag(tag.to_owned())) as Box<dyn AnySlot>
        });
        slot.as_any()
            .downcast_ref::<Slot<T>>()
            .expect("slot object type matches its TypeId key")
            .insert(items);
    }

    pub(crate) fn upcast_all(&self, tag: &str, target: TypeId) -> Option<Box<dyn std::any::Any>> {
        for by_tag in self.slots.values() {
            if let Some(slot) = by_tag.get(tag) {
                if let Some(found) = slot.upcast_to(target) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Clears every non-persistent collection and rewinds slot statuses,
    /// as part of returning the owning event to its pool.
    pub fn reset_all(&self) {
        for by_tag in self.slots.values() {
            for slot in by_tag.values() {
                slot.reset();
            }
        }
    }

    /// Runs `init` eagerly on every still-uninitialized factory. Used on
    /// the pre-flight set built at startup; failures there are reported by
    /// the caller and otherwise discarded, since the per-event slots will
    /// re-raise in context.
    pub fn preflight_init_all(&self) -> Result<()> {
        for by_tag in self.slots.values() {
            for slot in by_tag.values() {
                slot.preflight_init()?;
            }
        }
        Ok(())
    }

    /// `(object type name, tag, status)` for every slot, for reports.
    pub fn summaries(&self) -> Vec<(&'static str, String, FactoryStatus)> {
        let mut out = Vec::new();
        for by_tag in self.slots.values() {
            for slot in by_tag.values() {
                out.push((slot.object_type_name(), slot.tag().to_owned(), slot.status()));
            }
        }
        out
    }
}
