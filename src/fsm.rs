//! Generic finite state machine
//!
//! A machine is built from a [`StateTable`] that maps each state to the
//! handlers it runs on entry, on exit and for each event it accepts.
//! Handlers receive the machine itself and run without any lock held, so
//! they can request a transition from inside a handler.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// What a handler in the state table reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger<E> {
    /// The machine moved into the state
    Enter,
    /// The machine is about to move out of the state
    Leave,
    /// An event arrived while in the state
    On(E),
}

/// Errors raised by the state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("Initial state is not declared in the state table")]
    WrongInitialState,

    #[error("Event is not handled in the current state")]
    EventNotFound,

    #[error("Destination state is not declared in the state table")]
    NoStateExists,
}

pub type StateHandler<S, E> = Arc<dyn Fn(&Fsm<S, E>) + Send + Sync>;

/// Declarative state table
pub struct StateTable<S, E> {
    states: HashMap<S, HashMap<Trigger<E>, StateHandler<S, E>>>,
}

impl<S, E> StateTable<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Declare a state without attaching any handler
    pub fn state(mut self, state: S) -> Self {
        self.states.entry(state).or_default();
        self
    }

    /// Attach `handler` to `trigger` in `state`, declaring the state if needed
    pub fn on<F>(mut self, state: S, trigger: Trigger<E>, handler: F) -> Self
    where
        F: Fn(&Fsm<S, E>) + Send + Sync + 'static,
    {
        self.states
            .entry(state)
            .or_default()
            .insert(trigger, Arc::new(handler));
        self
    }

    fn contains(&self, state: &S) -> bool {
        self.states.contains_key(state)
    }

    fn handler(&self, state: &S, trigger: &Trigger<E>) -> Option<StateHandler<S, E>> {
        self.states
            .get(state)
            .and_then(|handlers| handlers.get(trigger))
            .cloned()
    }
}

impl<S, E> Default for StateTable<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// State machine over states `S` and events `E`
pub struct Fsm<S, E> {
    current: RwLock<S>,
    table: StateTable<S, E>,
}

impl<S, E> Fsm<S, E>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    /// Create a machine in `initial`, which must be declared in `table`
    pub fn new(initial: S, table: StateTable<S, E>) -> Result<Self, FsmError> {
        if !table.contains(&initial) {
            return Err(FsmError::WrongInitialState);
        }

        Ok(Self {
            current: RwLock::new(initial),
            table,
        })
    }

    pub fn current_state(&self) -> S {
        *self.current.read()
    }

    /// Run the current state's handler for `event`
    pub fn event(&self, event: E) -> Result<(), FsmError> {
        let state = self.current_state();
        let handler = self
            .table
            .handler(&state, &Trigger::On(event))
            .ok_or(FsmError::EventNotFound)?;

        debug!(state = ?state, event = ?event, "FSM event");
        handler(self);
        Ok(())
    }

    /// Move to `dest`, running the leave handler of the current state and the
    /// enter handler of `dest`
    pub fn transition(&self, dest: S) -> Result<(), FsmError> {
        if !self.table.contains(&dest) {
            return Err(FsmError::NoStateExists);
        }

        let from = self.current_state();
        if let Some(leave) = self.table.handler(&from, &Trigger::Leave) {
            leave(self);
        }

        *self.current.write() = dest;
        debug!(from = ?from, to = ?dest, "FSM transition");

        if let Some(enter) = self.table.handler(&dest, &Trigger::Enter) {
            enter(self);
        }
        Ok(())
    }
}

impl<S: fmt::Debug + Copy, E> fmt::Debug for Fsm<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("current", &*self.current.read())
            .finish()
    }
}
