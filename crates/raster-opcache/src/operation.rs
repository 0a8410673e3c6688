//! The `Operation` capability and its argument model.
//!
//! An operation is anything the cache can memoize: a name, a flat list
//! of typed arguments, and a `build` that actually does the (expensive)
//! work of producing an output image. The cache only ever looks at
//! `name()` and the hashable input arguments — it has no notion of
//! what an operation actually computes.

use raster_common::{Image, ImageId, RasterResult};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    /// Behavioural flags an operation can set to opt out of (or alter)
    /// normal memoization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperationFlags: u32 {
        /// A cached result for this operation must not be handed out;
        /// if one exists it is evicted and `build_or_reuse` errors
        /// rather than silently rebuilding.
        const BLOCKED = 1 << 0;
        /// Any existing cache entry is dropped and rebuilt rather than
        /// reused, even though one is present.
        const REVALIDATE = 1 << 1;
        /// Never consult or populate the cache for this call.
        const NOCACHE = 1 << 2;
    }
}

/// A single constructor argument value. Doubles are compared and
/// hashed by bit pattern (not `==`), so `NaN` arguments hash and
/// compare consistently rather than behaving as "never equal".
#[derive(Debug, Clone)]
pub enum ArgValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
    /// References another image by identity, not content. Two
    /// operations with the same upstream image compare equal on this
    /// argument regardless of that image's pixels.
    Image(ImageId),
}

impl PartialEq for ArgValue {
    fn eq(&self, other: &Self) -> bool {
        use ArgValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Bool(a), Bool(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Image(a), Image(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ArgValue {}

impl Hash for ArgValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ArgValue::Int(v) => v.hash(state),
            ArgValue::Double(v) => v.to_bits().hash(state),
            ArgValue::Bool(v) => v.hash(state),
            ArgValue::Str(v) => v.hash(state),
            ArgValue::Image(v) => v.hash(state),
        }
    }
}

/// One named constructor argument and the role it plays in hashing.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: &'static str,
    pub value: ArgValue,
    /// `true` for an input consumed to build the result; `false` for
    /// an output slot the operation fills in (outputs never enter the
    /// cache key).
    pub input: bool,
    pub required: bool,
    /// `false` excludes this argument from the cache key even though
    /// it's an input — for values that affect logging or diagnostics
    /// but not the computed result.
    pub hashable: bool,
}

impl Argument {
    pub fn required_input(name: &'static str, value: ArgValue) -> Self {
        Self {
            name,
            value,
            input: true,
            required: true,
            hashable: true,
        }
    }

    pub fn optional_input(name: &'static str, value: ArgValue) -> Self {
        Self {
            name,
            value,
            input: true,
            required: false,
            hashable: true,
        }
    }

    pub fn output(name: &'static str, value: ArgValue) -> Self {
        Self {
            name,
            value,
            input: false,
            required: false,
            hashable: false,
        }
    }

    /// Excludes an otherwise-hashable input argument from the cache
    /// key.
    pub fn unhashable(mut self) -> Self {
        self.hashable = false;
        self
    }
}

/// Handle returned by `Operation::on_invalidate`, passed back to
/// `Operation::disconnect` when the cache evicts the entry that
/// registered it.
pub type HandlerId = u64;

/// A memoizable unit of work: build an output image from a fixed set
/// of input arguments.
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;
    fn arguments(&self) -> &[Argument];
    fn flags(&self) -> OperationFlags {
        OperationFlags::empty()
    }
    /// Actually perform the (potentially expensive) work. Called at
    /// most once per distinct cache key, barring `REVALIDATE`/`NOCACHE`.
    fn build(&self) -> RasterResult<Arc<dyn Image>>;

    /// Register `handler` to run when this operation's cached result
    /// goes stale (e.g. an upstream image was mutated in place). The
    /// cache calls this once, right after a successful insert.
    ///
    /// Operations with nothing to watch (the common case in tests, and
    /// for pure functions of already-immutable inputs) keep the default
    /// no-op impl: it returns handle `0` and never calls `handler`.
    fn on_invalidate(&self, handler: Box<dyn Fn() + Send + Sync>) -> HandlerId {
        let _ = handler;
        0
    }

    /// Remove a handler previously returned by `on_invalidate`. Called
    /// by the cache when the owning entry is evicted or overwritten.
    fn disconnect(&self, id: HandlerId) {
        let _ = id;
    }
}

/// Minimal signal/slot box an `Operation` implementation can embed to
/// give `on_invalidate`/`disconnect` real behaviour, instead of every
/// operation hand-rolling its own handler list. `fire` is called by the
/// operation itself (or whatever wires it to an upstream image's own
/// invalidate notifier) whenever its cached result should be treated
/// as stale.
#[derive(Default)]
pub struct InvalidateSignal {
    handlers: Mutex<HashMap<HandlerId, Box<dyn Fn() + Send + Sync>>>,
    next_id: AtomicU64,
}

impl InvalidateSignal {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect(&self, handler: Box<dyn Fn() + Send + Sync>) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .expect("invalidate signal poisoned")
            .insert(id, handler);
        id
    }

    pub fn disconnect(&self, id: HandlerId) {
        self.handlers.lock().expect("invalidate signal poisoned").remove(&id);
    }

    /// Run every connected handler. Handlers are expected to be cheap
    /// (the cache's handler just flips an `invalid` bool under its
    /// mutex) — this is not a place for expensive work.
    pub fn fire(&self) {
        let handlers = self.handlers.lock().expect("invalidate signal poisoned");
        for handler in handlers.values() {
            handler();
        }
    }
}
