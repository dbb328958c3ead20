//! Ordered multicast of bus and timer events to the transport's listeners
//!
//! Listeners are held in an arena of generation tagged slots. While a listener reacts to an
//! event it is moved out of its slot, so it can ask to be removed (by returning
//! [Disposition::Remove]) without disturbing the iteration over the other listeners.
//! Freed slots are reused with a bumped generation, so a stale [ListenerId] can never remove
//! the listener which replaced it.

use crate::channel::{CanFrame, Timestamp};

/// Something that happened on the bus or the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A frame was seen on the bus. This includes the engine's own transmissions
    FrameObserved {
        /// The frame
        frame: CanFrame,
        /// When it was observed
        timestamp: Timestamp,
    },
    /// Time moved forward
    TimeAdvanced {
        /// Current time
        timestamp: Timestamp,
    },
}

impl Event {
    /// Time the event happened at
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Event::FrameObserved { timestamp, .. } => *timestamp,
            Event::TimeAdvanced { timestamp } => *timestamp,
        }
    }

    /// The observed frame, if this is a frame event
    pub fn frame(&self) -> Option<&CanFrame> {
        match self {
            Event::FrameObserved { frame, .. } => Some(frame),
            Event::TimeAdvanced { .. } => None,
        }
    }
}

/// Handle of a registered listener
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId {
    index: usize,
    generation: u32,
}

/// What a listener wants done with its registration after reacting
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Keep receiving events
    Keep,
    /// Unsubscribe
    Remove,
}

/// A participant of the event bus.
///
/// `C` is the context handed to every reaction, giving the listener access to whatever state
/// it mutates.
pub trait Listener<C>: Send {
    /// Predicate gating [Listener::react]
    fn wants(&self, event: &Event) -> bool;
    /// Reacts to an event the listener wanted
    fn react(&mut self, event: &Event, ctx: &mut C) -> Disposition;
}

struct Slot<C> {
    generation: u32,
    listener: Option<Box<dyn Listener<C>>>,
    occupied: bool,
}

/// Event bus
pub struct EventBus<C> {
    slots: Vec<Slot<C>>,
    free: Vec<usize>,
    order: Vec<ListenerId>,
}

impl<C> std::fmt::Debug for EventBus<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.order.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }
}

impl<C> EventBus<C> {
    /// Creates an empty event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. It is visited after every listener registered before it
    pub fn subscribe(&mut self, listener: Box<dyn Listener<C>>) -> ListenerId {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.listener = Some(listener);
                slot.occupied = true;
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    listener: Some(listener),
                    occupied: true,
                });
                self.slots.len() - 1
            }
        };
        let id = ListenerId {
            index,
            generation: self.slots[index].generation,
        };
        self.order.push(id);
        id
    }

    /// Removes a listener. Returns false if the ID is stale or unknown
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.release(id.index);
        self.order.retain(|x| *x != id);
        true
    }

    /// True if the listener is still registered
    pub fn contains(&self, id: ListenerId) -> bool {
        self.slots
            .get(id.index)
            .is_some_and(|s| s.occupied && s.generation == id.generation)
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.listener = None;
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    /// Delivers an event to every registered listener in registration order
    pub fn dispatch(&mut self, event: &Event, ctx: &mut C) {
        let count = self.order.len();
        let mut removed = false;
        for i in 0..count {
            let id = self.order[i];
            if !self.contains(id) {
                continue;
            }
            let Some(mut listener) = self.slots[id.index].listener.take() else {
                continue;
            };
            let disposition = if listener.wants(event) {
                listener.react(event, ctx)
            } else {
                Disposition::Keep
            };
            match disposition {
                Disposition::Keep => self.slots[id.index].listener = Some(listener),
                Disposition::Remove => {
                    self.release(id.index);
                    removed = true;
                }
            }
        }
        if removed {
            let slots = &self.slots;
            self.order.retain(|id| {
                slots
                    .get(id.index)
                    .is_some_and(|s| s.occupied && s.generation == id.generation)
            });
        }
    }
}
