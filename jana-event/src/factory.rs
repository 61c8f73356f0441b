use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use jana_log::warn;

use crate::{Error, Event, Result};

/// Lifecycle of a factory slot.
///
/// `init` runs at most once per slot instance, on first use. `process` runs
/// at most once per event; `get` memoizes. `Inserted` marks a collection
/// that bypassed the factory. `Broken` is terminal: a failed `init` poisons
/// the slot and every later `get` re-raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryStatus {
    /// `init` has not run yet.
    Uninitialized,
    /// Ready to process the current event.
    Unprocessed,
    /// `process` ran; the collection is cached.
    Processed,
    /// The collection was inserted directly, bypassing `process`.
    Inserted,
    /// `init` failed; permanently unusable.
    Broken,
}

/// A lazy producer of one typed collection per event.
///
/// Implementations are memoized by the owning [`Slot`]: the framework
/// guarantees `process` runs at most once per event no matter how many
/// concurrent `get` calls race, and `change_run` runs whenever the observed
/// run number changes.
pub trait Factory: Send {
    /// Record type of the produced collection.
    type Object: Send + 'static;

    /// One-time setup. A failure here permanently breaks the slot.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before `process` whenever the run number differs from the
    /// previously observed one.
    fn change_run(&mut self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Produces the collection for one event.
    fn process(&mut self, event: &Event) -> Result<Vec<Self::Object>>;
}

// Backs collections created by `insert` when no user factory was
// registered for the (type, tag) pair. Processing one yields nothing.
struct InsertOnly<T>(PhantomData<fn() -> T>);

impl<T: Send + 'static> Factory for InsertOnly<T> {
    type Object = T;

    fn process(&mut self, _event: &Event) -> Result<Vec<T>> {
        Ok(Vec::new())
    }
}

type UpcastFn<T> = Box<dyn Fn(&[T]) -> Box<dyn Any> + Send + Sync>;

struct SlotState<T> {
    status: FactoryStatus,
    collection: Vec<T>,
    prev_run_nr: Option<u32>,
    init_error: Option<String>,
    factory: Box<dyn Factory<Object = T>>,
}

/// A registered factory plus its memoized collection and status.
///
/// Built with [`Slot::new`] and the chained configuration methods, then
/// handed to `FactorySet::add`:
///
/// ```ignore
/// set.add(Slot::new(ClusterFactory::default())
///     .tag("evt")
///     .plugin("calorimetry")
///     .upcast::<Hit>(|c| c.seed_hit.clone()))?;
/// ```
pub struct Slot<T: Send + 'static> {
    object_type_name: &'static str,
    tag: String,
    plugin: String,
    factory_name: String,
    persistent: bool,
    upcasts: HashMap<TypeId, UpcastFn<T>>,
    state: Mutex<SlotState<T>>,
}

impl<T: Send + 'static> Slot<T> {
    /// Wraps a factory in a slot with the empty tag.
    pub fn new<F>(factory: F) -> Self
    where
        F: Factory<Object = T> + 'static,
    {
        Self {
            object_type_name: std::any::type_name::<T>(),
            tag: String::new(),
            plugin: String::new(),
            factory_name: std::any::type_name::<F>().to_string(),
            persistent: false,
            upcasts: HashMap::new(),
            state: Mutex::new(SlotState {
                status: FactoryStatus::Uninitialized,
                collection: Vec::new(),
                prev_run_nr: None,
                init_error: None,
                factory: Box::new(factory),
            }),
        }
    }

    pub(crate) fn insert_only() -> Self {
        Self::new(InsertOnly::<T>(PhantomData))
    }

    /// Sets the collection tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Records the plugin that registered this factory, for error context.
    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }

    /// Marks the collection persistent: it survives event recycling and is
    /// only replaced by an explicit re-`insert` or `change_run`.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Declares that this factory's objects can be viewed as `S` through
    /// the given conversion. Without this declaration, `get_as::<S>` yields
    /// an empty collection.
    pub fn upcast<S: Send + 'static>(mut self, f: fn(&T) -> S) -> Self {
        self.upcasts.insert(
            TypeId::of::<S>(),
            Box::new(move |items: &[T]| {
                Box::new(items.iter().map(f).collect::<Vec<S>>()) as Box<dyn Any>
            }),
        );
        self
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        // A panic in user code must not wedge recycling.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broken_error(&self, message: String) -> Error {
        Error::FactoryBroken {
            factory: self.factory_name.to_owned(),
            tag: self.tag.clone(),
            message,
        }
    }

    /// Memoized fetch: runs `init`/`change_run`/`process` as needed, then
    /// returns a borrowed view of the collection.
    ///
    /// The slot stays locked for the duration of `process`, which is what
    /// makes processing at-most-once under concurrent `get` calls; a
    /// factory that (transitively) requests its own collection will
    /// deadlock, exactly like a cyclic factory dependency.
    pub(crate) fn fetch(&self, event: &Event) -> Result<CollectionRef<'_, T>> {
        let mut state = self.lock();
        match state.status {
            FactoryStatus::Broken => {
                let message = state.init_error.clone().unwrap_or_default();
                return Err(self.broken_error(message));
            }
            FactoryStatus::Processed | FactoryStatus::Inserted => {}
            FactoryStatus::Uninitialized | FactoryStatus::Unprocessed => {
                if state.status == FactoryStatus::Uninitialized {
                    if let Err(err) = state.factory.init() {
                        let message = err.to_string();
                        warn!(
                            "factory '{}' (tag '{}') is now permanently broken: {message}",
                            self.factory_name, self.tag
                        );
                        state.status = FactoryStatus::Broken;
                        state.init_error = Some(message.clone());
                        return Err(self.broken_error(message));
                    }
                    state.status = FactoryStatus::Unprocessed;
                }
                if state.prev_run_nr != Some(event.run_nr()) {
                    state
                        .factory
                        .change_run(event)
                        .map_err(|err| self.annotate(err))?;
                    state.prev_run_nr = Some(event.run_nr());
                }
                let collection = state
                    .factory
                    .process(event)
                    .map_err(|err| self.annotate(err))?;
                state.collection = collection;
                state.status = FactoryStatus::Processed;
            }
        }
        Ok(CollectionRef { guard: state })
    }

    fn annotate(&self, err: Error) -> Error {
        err.annotate(&self.plugin, "", &self.factory_name, &self.tag)
    }

    pub(crate) fn insert(&self, items: Vec<T>) {
        let mut state = self.lock();
        state.collection = items;
        state.status = FactoryStatus::Inserted;
    }
}

/// Object-safe view of a slot, keyed into the factory set.
pub(crate) trait AnySlot: Send + Sync {
    fn object_type(&self) -> TypeId;
    fn object_type_name(&self) -> &'static str;
    fn tag(&self) -> &str;
    fn status(&self) -> FactoryStatus;
    fn reset(&self);
    fn preflight_init(&self) -> Result<()>;
    fn upcast_to(&self, target: TypeId) -> Option<Box<dyn Any>>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> AnySlot for Slot<T> {
    fn object_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn object_type_name(&self) -> &'static str {
        self.object_type_name
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn status(&self) -> FactoryStatus {
        self.lock().status
    }

    fn reset(&self) {
        let mut state = self.lock();
        match state.status {
            FactoryStatus::Uninitialized | FactoryStatus::Broken => {}
            _ if self.persistent => {}
            _ => {
                state.collection.clear();
                state.status = FactoryStatus::Unprocessed;
            }
        }
    }

    fn preflight_init(&self) -> Result<()> {
        let mut state = self.lock();
        if state.status == FactoryStatus::Uninitialized {
            state.factory.init()?;
            state.status = FactoryStatus::Unprocessed;
        }
        Ok(())
    }

    fn upcast_to(&self, target: TypeId) -> Option<Box<dyn Any>> {
        let f = self.upcasts.get(&target)?;
        let state = self.lock();
        Some(f(&state.collection))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Borrowed view of a collection, held while the slot stays locked.
///
/// Dereferences to `[T]`. Keep it short-lived: holding one blocks other
/// `get` calls for the same `(type, tag)` on this event.
pub struct CollectionRef<'a, T: Send + 'static> {
    guard: MutexGuard<'a, SlotState<T>>,
}

impl<T: Send + 'static> Deref for CollectionRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard.collection
    }
}
