//! Observer registry with reentrancy-safe dispatch.
//!
//! # Responsibility
//! - Hold `(mask, kind filter, observer)` subscriptions in registration order.
//! - Deliver each grouped notification once per matching subscription.
//! - Tolerate observers that subscribe or unsubscribe from their callback.
//!
//! # Invariants
//! - Slots never shift while any dispatch pass is running; removals made
//!   during a pass are tombstoned and compacted once the outermost pass ends.
//! - A tombstoned subscription is never called again.
//! - A subscription added during a pass is not visited by that pass.
//! - One thread dispatches at a time; the owning thread may re-enter.

use crate::event::pending::GroupedNotification;
use crate::model::change::ChangeMask;
use crate::model::entity::{Entity, EntityKind};
use log::debug;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const GROW_SIZE: usize = 4;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The subscription mask selects no change kind.
    EmptyMask,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMask => write!(f, "subscription mask selects no change kind"),
        }
    }
}

impl Error for RegistryError {}

/// Receiver of grouped change notifications.
///
/// Called synchronously on the thread that committed the transaction.
pub trait Observer: Send + Sync {
    fn on_notification(&self, notification: &GroupedNotification);
}

impl<F> Observer for F
where
    F: Fn(&GroupedNotification) + Send + Sync,
{
    fn on_notification(&self, notification: &GroupedNotification) {
        self(notification)
    }
}

/// Which entity kinds a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFilter {
    /// Every kind.
    Any,
    /// One kind name, matched against the kind itself and its supertypes.
    Kind(&'static str),
}

impl KindFilter {
    /// Filter for entity type `T` and every kind declaring it as a supertype.
    pub fn of<T: Entity>() -> Self {
        Self::Kind(T::KIND.name)
    }

    pub fn matches(&self, kind: &EntityKind) -> bool {
        match self {
            Self::Any => true,
            Self::Kind(name) => kind.satisfies(name),
        }
    }
}

struct Subscription {
    mask: ChangeMask,
    filter: KindFilter,
    observer: Arc<dyn Observer>,
    seq: u64,
}

impl Subscription {
    fn matches(&self, kind: &EntityKind, mask: ChangeMask) -> bool {
        self.mask.intersects(mask) && self.filter.matches(kind)
    }

    fn is(&self, mask: ChangeMask, filter: KindFilter, observer: &Arc<dyn Observer>) -> bool {
        self.mask == mask
            && self.filter == filter
            && std::ptr::addr_eq(Arc::as_ptr(&self.observer), Arc::as_ptr(observer))
    }
}

#[derive(Default)]
struct State {
    slots: Vec<Option<Subscription>>,
    depth: usize,
    compact_pending: bool,
    next_seq: u64,
}

impl State {
    fn compact(&mut self) {
        let before = self.slots.len();
        self.slots.retain(Option::is_some);
        let live = self.slots.len();
        let padded = live.div_ceil(GROW_SIZE) * GROW_SIZE;
        self.slots.resize_with(padded, || None);
        self.compact_pending = false;
        debug!(
            "event=registry_compact module=event status=ok live={} slots_before={} slots_after={}",
            live, before, padded
        );
    }
}

/// Dynamic set of observer subscriptions.
#[derive(Default)]
pub struct ObserverRegistry {
    state: ReentrantMutex<RefCell<State>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription after the last occupied slot.
    ///
    /// # Errors
    /// - `EmptyMask` when `mask` selects no change kind.
    pub fn subscribe(
        &self,
        mask: ChangeMask,
        filter: KindFilter,
        observer: Arc<dyn Observer>,
    ) -> RegistryResult<()> {
        if mask.is_empty() {
            return Err(RegistryError::EmptyMask);
        }

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let index = state
            .slots
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1);
        if index >= state.slots.len() {
            let grown = state.slots.len() + GROW_SIZE;
            state.slots.resize_with(grown, || None);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots[index] = Some(Subscription {
            mask,
            filter,
            observer,
            seq,
        });
        Ok(())
    }

    /// Removes the subscription registered with exactly this mask, filter and
    /// observer instance. Unknown triples are ignored.
    ///
    /// Returns true when a subscription was removed.
    pub fn unsubscribe(
        &self,
        mask: ChangeMask,
        filter: KindFilter,
        observer: &Arc<dyn Observer>,
    ) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(index) = state.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|subscription| subscription.is(mask, filter, observer))
        }) else {
            return false;
        };

        if state.depth > 0 {
            state.slots[index] = None;
            state.compact_pending = true;
            debug!(
                "event=observer_unsubscribe_deferred module=event status=ok slot={} depth={}",
                index, state.depth
            );
        } else {
            state.slots.remove(index);
            state.slots.push(None);
        }
        true
    }

    /// Calls every subscription whose filter accepts the notification's kind
    /// and whose mask intersects its change. Returns the number of calls.
    ///
    /// Observer callbacks run with the registry lock held by this thread, so
    /// they may subscribe, unsubscribe or dispatch again; other threads wait
    /// until the pass completes.
    pub fn dispatch(&self, notification: &GroupedNotification) -> usize {
        if notification.is_empty() {
            return 0;
        }
        let kind = notification.kind();
        let mask = notification.change().mask();

        let guard = self.state.lock();
        let pass = DispatchPass::enter(&guard);

        let mut delivered = 0;
        let mut index = 0;
        loop {
            let target = {
                let state = guard.borrow();
                if index >= state.slots.len() {
                    break;
                }
                state.slots[index]
                    .as_ref()
                    .filter(|subscription| {
                        subscription.seq < pass.start_seq && subscription.matches(&kind, mask)
                    })
                    .map(|subscription| Arc::clone(&subscription.observer))
            };
            index += 1;

            if let Some(observer) = target {
                observer.on_notification(notification);
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when a dispatch for `kind` and `mask` would reach at least
    /// one subscription.
    pub fn has_subscribers(&self, mask: ChangeMask, kind: &EntityKind) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .slots
            .iter()
            .flatten()
            .any(|subscription| subscription.matches(kind, mask))
    }

    /// Current backing slot count, including tombstones and spare capacity.
    pub fn slot_capacity(&self) -> usize {
        let guard = self.state.lock();
        let len = guard.borrow().slots.len();
        len
    }
}

/// Tracks one dispatch pass; leaving the outermost pass compacts tombstones,
/// also when an observer panics.
struct DispatchPass<'a> {
    state: &'a RefCell<State>,
    start_seq: u64,
}

impl<'a> DispatchPass<'a> {
    fn enter(state: &'a RefCell<State>) -> Self {
        let mut inner = state.borrow_mut();
        inner.depth += 1;
        let start_seq = inner.next_seq;
        drop(inner);
        Self { state, start_seq }
    }
}

impl Drop for DispatchPass<'_> {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.depth -= 1;
        if state.depth == 0 && state.compact_pending {
            state.compact();
        }
    }
}
