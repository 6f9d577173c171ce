//! Buffer state machines behind the debounce and batch middleware.
//!
//! Both follow `Idle -> Buffering -> Flushing -> Idle`. Every timer is
//! tagged with the generation it was scheduled for; a timer whose
//! generation is stale when it fires does nothing. That rule alone covers
//! overlapping windows and timers racing a rescheduling.

use crate::action::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowPhase {
    #[default]
    Idle,
    Buffering,
    Flushing,
}

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

/// Last-wins slot for one debounced action type.
#[derive(Debug, Default)]
pub struct DebounceSlot {
    pending: Option<Action>,
    generation: u64,
    phase: WindowPhase,
}

impl DebounceSlot {
    /// Replace any pending action. Returns the generation the caller must
    /// schedule a timer for; earlier timers become stale.
    pub fn offer(&mut self, action: Action) -> u64 {
        self.generation += 1;
        self.pending = Some(action);
        self.phase = WindowPhase::Buffering;
        self.generation
    }

    /// The timer for `generation` expired. Yields the action to deliver if
    /// that timer is still current.
    pub fn fire(&mut self, generation: u64) -> Option<Action> {
        if generation != self.generation || self.phase != WindowPhase::Buffering {
            return None;
        }
        self.phase = WindowPhase::Flushing;
        self.pending.take()
    }

    /// Delivery finished. A newer offer made during delivery keeps its phase.
    pub fn settle(&mut self) {
        if self.phase == WindowPhase::Flushing {
            self.phase = WindowPhase::Idle;
        }
    }

    /// Drop the pending action and invalidate outstanding timers.
    pub fn cancel(&mut self) -> Option<Action> {
        self.generation += 1;
        self.phase = WindowPhase::Idle;
        self.pending.take()
    }

    pub fn phase(&self) -> WindowPhase {
        self.phase
    }

    pub fn pending(&self) -> Option<&Action> {
        self.pending.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Outcome of pushing an action into a [`BatchWindow`].
#[derive(Debug, PartialEq)]
pub enum Push {
    /// First action of a window; schedule a timer for this generation.
    OpenWindow(u64),
    /// Joined the open window.
    Buffered,
    /// Size limit reached; deliver these now.
    Full(Vec<Action>),
}

#[derive(Debug, Default)]
pub struct BatchWindow {
    buffer: Vec<Action>,
    generation: u64,
    phase: WindowPhase,
    max_size: Option<usize>,
}

impl BatchWindow {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            max_size: max_size.filter(|n| *n > 0),
            ..Self::default()
        }
    }

    pub fn push(&mut self, action: Action) -> Push {
        self.buffer.push(action);
        if self.max_size.is_some_and(|max| self.buffer.len() >= max) {
            self.generation += 1;
            self.phase = WindowPhase::Flushing;
            return Push::Full(std::mem::take(&mut self.buffer));
        }
        if self.phase == WindowPhase::Buffering {
            return Push::Buffered;
        }
        self.generation += 1;
        self.phase = WindowPhase::Buffering;
        Push::OpenWindow(self.generation)
    }

    /// The window timer for `generation` expired.
    pub fn fire(&mut self, generation: u64) -> Option<Vec<Action>> {
        if generation != self.generation || self.phase != WindowPhase::Buffering {
            return None;
        }
        self.phase = WindowPhase::Flushing;
        let items = std::mem::take(&mut self.buffer);
        (!items.is_empty()).then_some(items)
    }

    pub fn settle(&mut self) {
        if self.phase == WindowPhase::Flushing {
            self.phase = WindowPhase::Idle;
        }
    }

    /// Drop everything buffered and invalidate the open window.
    pub fn cancel(&mut self) -> Vec<Action> {
        self.generation += 1;
        self.phase = WindowPhase::Idle;
        std::mem::take(&mut self.buffer)
    }

    pub fn phase(&self) -> WindowPhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
