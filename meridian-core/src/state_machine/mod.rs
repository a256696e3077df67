//! Generic guarded finite state machine
//!
//! A [`StateMachine`] is an immutable, validated table of transitions. It is
//! shared (usually behind an `Arc`) by every entity of the same kind, while the
//! current state lives with the entity itself or in a [`StateMachineInstance`].
//!
//! Transitions matching the same `(from, event)` pair are tried in declaration
//! order and the first one whose guard passes wins.

use crate::error::{MachineDefinitionError, TransitionRejection};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Pure predicate over the entity context
pub type Guard<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// Side effect run when a transition is accepted
pub type Action<C> = Arc<dyn Fn(&C) -> Result<(), String> + Send + Sync>;

/// Trait bounds shared by state and event types
pub trait MachineSymbol: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> MachineSymbol for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// One `(from, event) -> to` edge
pub struct Transition<S, E, C> {
    pub from: S,
    pub event: E,
    pub to: S,
    guard: Option<Guard<C>>,
    action: Option<Action<C>>,
}

impl<S: MachineSymbol, E: MachineSymbol, C> Transition<S, E, C> {
    pub fn new(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            guard: None,
            action: None,
        }
    }

    pub fn with_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&C) -> Result<(), String> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    fn allows(&self, context: &C) -> bool {
        self.guard.as_ref().map_or(true, |guard| guard(context))
    }
}

impl<S: fmt::Debug, E: fmt::Debug, C> fmt::Debug for Transition<S, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("event", &self.event)
            .field("to", &self.to)
            .field("guarded", &self.guard.is_some())
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

/// Accepted transition. The state change stands even if the action failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome<S> {
    pub from: S,
    pub to: S,
    pub action_error: Option<String>,
}

impl<S> TransitionOutcome<S> {
    /// The transition was applied but its side effect reported an error
    pub fn action_failed(&self) -> bool {
        self.action_error.is_some()
    }
}

/// Validated state machine definition
pub struct StateMachine<S, E, C> {
    name: String,
    states: Vec<S>,
    initial: S,
    terminal: HashSet<S>,
    transitions: Vec<Transition<S, E, C>>,
}

impl<S: MachineSymbol, E: MachineSymbol, C> StateMachine<S, E, C> {
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder<S, E, C> {
        StateMachineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> S {
        self.initial
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Evaluate `event` in `current`. Never mutates anything on rejection.
    pub fn transition(
        &self,
        current: S,
        event: E,
        context: &C,
    ) -> Result<TransitionOutcome<S>, TransitionRejection> {
        if self.is_terminal(current) {
            return Err(TransitionRejection::TerminalState {
                state: format!("{:?}", current),
            });
        }

        let mut matched = false;
        for candidate in self
            .transitions
            .iter()
            .filter(|t| t.from == current && t.event == event)
        {
            matched = true;
            if !candidate.allows(context) {
                continue;
            }

            let action_error = candidate
                .action
                .as_ref()
                .and_then(|action| action(context).err());
            if let Some(err) = &action_error {
                tracing::warn!(
                    machine = %self.name,
                    from = ?current,
                    to = ?candidate.to,
                    error = %err,
                    "Transition action failed"
                );
            }

            return Ok(TransitionOutcome {
                from: current,
                to: candidate.to,
                action_error,
            });
        }

        let rejection = if matched {
            TransitionRejection::GuardFailed {
                state: format!("{:?}", current),
                event: format!("{:?}", event),
            }
        } else {
            TransitionRejection::NoMatchingTransition {
                state: format!("{:?}", current),
                event: format!("{:?}", event),
            }
        };
        tracing::debug!(machine = %self.name, %rejection, "Transition rejected");
        Err(rejection)
    }
}

impl<S: fmt::Debug, E: fmt::Debug, C> fmt::Debug for StateMachine<S, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("initial", &self.initial)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

/// Builder validating the definition on [`StateMachineBuilder::build`]
pub struct StateMachineBuilder<S, E, C> {
    name: String,
    states: Vec<S>,
    initial: Option<S>,
    terminal: Vec<S>,
    transitions: Vec<Transition<S, E, C>>,
}

impl<S: MachineSymbol, E: MachineSymbol, C> StateMachineBuilder<S, E, C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            initial: None,
            terminal: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(mut self, state: S) -> Self {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    pub fn states(self, states: impl IntoIterator<Item = S>) -> Self {
        states.into_iter().fold(self, |builder, s| builder.state(s))
    }

    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.push(state);
        self
    }

    pub fn transition(mut self, transition: Transition<S, E, C>) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn build(self) -> Result<StateMachine<S, E, C>, MachineDefinitionError> {
        if self.states.is_empty() {
            return Err(MachineDefinitionError::Empty(self.name));
        }
        let initial = self
            .initial
            .ok_or_else(|| MachineDefinitionError::NoInitialState(self.name.clone()))?;

        let declared: HashSet<S> = self.states.iter().copied().collect();
        let undeclared = |s: &S| MachineDefinitionError::UndeclaredState {
            state: format!("{:?}", s),
        };

        if !declared.contains(&initial) {
            return Err(undeclared(&initial));
        }
        if let Some(s) = self.terminal.iter().find(|s| !declared.contains(s)) {
            return Err(undeclared(s));
        }
        for t in &self.transitions {
            if !declared.contains(&t.from) {
                return Err(undeclared(&t.from));
            }
            if !declared.contains(&t.to) {
                return Err(undeclared(&t.to));
            }
        }

        // Breadth-first reachability from the initial state
        let mut reachable = HashSet::from([initial]);
        let mut queue = VecDeque::from([initial]);
        while let Some(state) = queue.pop_front() {
            for t in self.transitions.iter().filter(|t| t.from == state) {
                if reachable.insert(t.to) {
                    queue.push_back(t.to);
                }
            }
        }
        if let Some(s) = self.states.iter().find(|s| !reachable.contains(s)) {
            return Err(MachineDefinitionError::Unreachable {
                state: format!("{:?}", s),
            });
        }

        let terminal: HashSet<S> = self.terminal.into_iter().collect();
        for s in &self.states {
            if !terminal.contains(s) && !self.transitions.iter().any(|t| t.from == *s) {
                return Err(MachineDefinitionError::DeadEnd {
                    state: format!("{:?}", s),
                });
            }
        }

        Ok(StateMachine {
            name: self.name,
            states: self.states,
            initial,
            terminal,
            transitions: self.transitions,
        })
    }
}

/// A machine paired with the current state of one entity
pub struct StateMachineInstance<S, E, C> {
    machine: Arc<StateMachine<S, E, C>>,
    current: S,
}

impl<S: MachineSymbol, E: MachineSymbol, C> StateMachineInstance<S, E, C> {
    pub fn new(machine: Arc<StateMachine<S, E, C>>) -> Self {
        let current = machine.initial_state();
        Self { machine, current }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.machine.is_terminal(self.current)
    }

    /// Fire an event, moving to the new state when accepted
    pub fn fire(
        &mut self,
        event: E,
        context: &C,
    ) -> Result<TransitionOutcome<S>, TransitionRejection> {
        let outcome = self.machine.transition(self.current, event, context)?;
        self.current = outcome.to;
        Ok(outcome)
    }
}

impl<S: fmt::Debug, E, C> fmt::Debug for StateMachineInstance<S, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineInstance")
            .field("machine", &self.machine.name)
            .field("current", &self.current)
            .finish()
    }
}
