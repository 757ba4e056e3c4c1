//! Generic finite-state machine with guards, hooks, history, and snapshots.
//!
//! A transition runs, in order: the outgoing state's exit hook, the
//! transition action, and the incoming state's entry hook. Hooks operate on a
//! working copy of the context; the copy and the new current state are
//! committed together only after all three succeed.
//!
//! Transitions on one machine are serialized. Listeners are invoked inline
//! and may read the machine, but must not call `transition` on it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::StateMachineError;
use crate::event::{EventBus, SubscriptionId};

/// Bounds required of a state type.
pub trait MachineState: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> MachineState for T where T: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

pub type Guard<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;
pub type StateHook<C> = Arc<dyn Fn(&mut C) -> Result<(), String> + Send + Sync>;
pub type TransitionAction<S, C> = Arc<dyn Fn(&mut C, S, S) -> Result<(), String> + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A named state with optional entry/exit hooks.
pub struct StateConfig<S, C> {
    pub state: S,
    pub on_enter: Option<StateHook<C>>,
    pub on_exit: Option<StateHook<C>>,
    pub metadata: HashMap<String, Value>,
}

impl<S, C> StateConfig<S, C> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            on_enter: None,
            on_exit: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn on_enter<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A permitted move from any of `from` to `to`.
pub struct TransitionConfig<S, C> {
    pub from: Vec<S>,
    pub to: S,
    pub guard: Option<Guard<C>>,
    pub action: Option<TransitionAction<S, C>>,
}

impl<S, C> TransitionConfig<S, C> {
    pub fn new(from: impl Into<Vec<S>>, to: S) -> Self {
        Self {
            from: from.into(),
            to,
            guard: None,
            action: None,
        }
    }

    #[must_use]
    pub fn with_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    #[must_use]
    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut C, S, S) -> Result<(), String> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub max_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
        }
    }
}

pub struct StateMachineConfig<S, C> {
    pub id: String,
    pub initial: S,
    pub states: Vec<StateConfig<S, C>>,
    pub transitions: Vec<TransitionConfig<S, C>>,
    pub context: C,
    pub history: HistoryConfig,
}

// ---------------------------------------------------------------------------
// History, snapshots, events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord<S> {
    pub from: S,
    pub to: S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Replayable capture of a machine's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot<S, C> {
    pub id: String,
    pub current: S,
    pub context: C,
    pub history: Vec<TransitionRecord<S>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent<S> {
    TransitionStarted {
        from: S,
        to: S,
        trigger: Option<String>,
    },
    StateExited {
        state: S,
    },
    StateEntered {
        state: S,
    },
    TransitionCompleted {
        from: S,
        to: S,
        trigger: Option<String>,
    },
    /// No permitted transition (or its guard returned false).
    TransitionDenied {
        from: S,
        to: S,
        trigger: Option<String>,
    },
    TransitionFailed {
        from: S,
        to: S,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

struct Runtime<S, C> {
    current: S,
    context: C,
    history: VecDeque<TransitionRecord<S>>,
}

pub struct StateMachine<S, C> {
    id: String,
    initial: S,
    states: HashMap<S, StateConfig<S, C>>,
    transitions: Vec<TransitionConfig<S, C>>,
    history_config: HistoryConfig,
    /// Held for the whole of every mutating operation.
    serial: Mutex<()>,
    runtime: Mutex<Runtime<S, C>>,
    events: EventBus<MachineEvent<S>>,
}

impl<S, C> StateMachine<S, C>
where
    S: MachineState,
    C: Clone + Send + Sync + 'static,
{
    /// Build a machine, rejecting configs that reference undeclared states.
    pub fn new(config: StateMachineConfig<S, C>) -> Result<Self, StateMachineError> {
        let invalid = |message: String| StateMachineError::InvalidConfig {
            machine: config.id.clone(),
            message,
        };

        let mut states = HashMap::with_capacity(config.states.len());
        let mut declared = HashSet::new();
        for state in &config.states {
            if !declared.insert(state.state) {
                return Err(invalid(format!("state {:?} is declared twice", state.state)));
            }
        }
        if !declared.contains(&config.initial) {
            return Err(invalid(format!(
                "initial state {:?} is not a declared state",
                config.initial
            )));
        }
        for (index, transition) in config.transitions.iter().enumerate() {
            if transition.from.is_empty() {
                return Err(invalid(format!("transition #{index} has no source states")));
            }
            if let Some(unknown) = transition.from.iter().find(|s| !declared.contains(s)) {
                return Err(invalid(format!(
                    "transition #{index} references undeclared source state {unknown:?}"
                )));
            }
            if !declared.contains(&transition.to) {
                return Err(invalid(format!(
                    "transition #{index} references undeclared target state {:?}",
                    transition.to
                )));
            }
        }

        let StateMachineConfig {
            id,
            initial,
            states: state_configs,
            transitions,
            context,
            history,
        } = config;
        for state in state_configs {
            states.insert(state.state, state);
        }

        Ok(Self {
            id,
            initial,
            states,
            transitions,
            history_config: history,
            serial: Mutex::new(()),
            runtime: Mutex::new(Runtime {
                current: initial,
                context,
                history: VecDeque::new(),
            }),
            events: EventBus::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_state(&self) -> S {
        self.lock_runtime().current
    }

    pub fn context(&self) -> C {
        self.lock_runtime().context.clone()
    }

    pub fn history(&self) -> Vec<TransitionRecord<S>> {
        self.lock_runtime().history.iter().cloned().collect()
    }

    pub fn state_metadata(&self, state: S) -> Option<&HashMap<String, Value>> {
        self.states.get(&state).map(|s| &s.metadata)
    }

    /// Whether a transition to `target` is permitted right now. No side effects.
    pub fn can_transition_to(&self, target: S) -> bool {
        let runtime = self.lock_runtime();
        self.find_transition(runtime.current, target, &runtime.context)
            .is_some()
    }

    /// Every destination currently reachable in one transition.
    pub fn available_transitions(&self) -> Vec<S> {
        let runtime = self.lock_runtime();
        let mut targets = Vec::new();
        for transition in &self.transitions {
            if !transition.from.contains(&runtime.current) || targets.contains(&transition.to) {
                continue;
            }
            if transition.guard.as_ref().is_none_or(|g| g(&runtime.context)) {
                targets.push(transition.to);
            }
        }
        targets
    }

    /// True when the current state has no outgoing transitions.
    pub fn is_final_state(&self) -> bool {
        let current = self.current_state();
        !self.transitions.iter().any(|t| t.from.contains(&current))
    }

    /// Attempt to move to `target`.
    ///
    /// Returns `Ok(false)` when no permitted transition exists. Returns an
    /// error when a hook or action fails; the current state and context are
    /// left unchanged in that case.
    pub fn transition(&self, target: S, trigger: Option<&str>) -> Result<bool, StateMachineError> {
        self.transition_with(target, trigger, |_, _| true)
    }

    /// Like [`transition`](Self::transition), with `prepare` run first on
    /// the current state and a working copy of the context, inside the
    /// same critical section as the commit. Returning `false` denies the
    /// transition; edits to the context are committed only with it.
    pub fn transition_with<F>(
        &self,
        target: S,
        trigger: Option<&str>,
        prepare: F,
    ) -> Result<bool, StateMachineError>
    where
        F: FnOnce(S, &mut C) -> bool,
    {
        let _serial = self.lock_serial();
        let trigger = trigger.map(str::to_string);

        let (from, permitted) = {
            let runtime = self.lock_runtime();
            let from = runtime.current;
            let permitted = self
                .find_transition(from, target, &runtime.context)
                .map(|index| (index, runtime.context.clone()));
            (from, permitted)
        };
        let prepared = permitted.and_then(|(index, mut working)| {
            prepare(from, &mut working).then_some((index, working))
        });
        let Some((transition_index, mut working)) = prepared else {
            debug!(machine = %self.id, ?from, to = ?target, "transition denied");
            self.events.publish(&MachineEvent::TransitionDenied {
                from,
                to: target,
                trigger,
            });
            return Ok(false);
        };

        self.events.publish(&MachineEvent::TransitionStarted {
            from,
            to: target,
            trigger: trigger.clone(),
        });

        if let Err(message) = self.run_hooks(from, target, transition_index, &mut working) {
            self.events.publish(&MachineEvent::TransitionFailed {
                from,
                to: target,
                error: message.clone(),
            });
            return Err(StateMachineError::HookFailed {
                from: format!("{from:?}"),
                to: format!("{target:?}"),
                message,
            });
        }

        {
            let mut runtime = self.lock_runtime();
            runtime.current = target;
            runtime.context = working;
            if self.history_config.enabled {
                runtime.history.push_back(TransitionRecord {
                    from,
                    to: target,
                    trigger: trigger.clone(),
                    timestamp: Utc::now(),
                });
                while runtime.history.len() > self.history_config.max_size {
                    runtime.history.pop_front();
                }
            }
        }

        self.events.publish(&MachineEvent::TransitionCompleted {
            from,
            to: target,
            trigger,
        });
        Ok(true)
    }

    /// Replace the context with the result of `f`.
    pub fn update_context<F>(&self, f: F)
    where
        F: FnOnce(&C) -> C,
    {
        let _serial = self.lock_serial();
        let mut runtime = self.lock_runtime();
        runtime.context = f(&runtime.context);
    }

    pub fn set_context(&self, context: C) {
        let _serial = self.lock_serial();
        self.lock_runtime().context = context;
    }

    /// Return to the initial state and clear history. The context is kept.
    pub fn reset(&self) {
        let _serial = self.lock_serial();
        let mut runtime = self.lock_runtime();
        runtime.current = self.initial;
        runtime.history.clear();
    }

    pub fn snapshot(&self) -> MachineSnapshot<S, C> {
        let runtime = self.lock_runtime();
        MachineSnapshot {
            id: self.id.clone(),
            current: runtime.current,
            context: runtime.context.clone(),
            history: runtime.history.iter().cloned().collect(),
        }
    }

    /// Replay a snapshot taken from a machine with the same ID.
    pub fn restore(&self, snapshot: MachineSnapshot<S, C>) -> Result<(), StateMachineError> {
        if snapshot.id != self.id {
            return Err(StateMachineError::SnapshotMismatch {
                expected: self.id.clone(),
                actual: snapshot.id,
            });
        }
        if !self.states.contains_key(&snapshot.current) {
            return Err(StateMachineError::InvalidConfig {
                machine: self.id.clone(),
                message: format!(
                    "snapshot state {:?} is not a declared state",
                    snapshot.current
                ),
            });
        }

        let _serial = self.lock_serial();
        let mut history: VecDeque<_> = snapshot.history.into();
        while history.len() > self.history_config.max_size {
            history.pop_front();
        }
        let mut runtime = self.lock_runtime();
        runtime.current = snapshot.current;
        runtime.context = snapshot.context;
        runtime.history = history;
        Ok(())
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&MachineEvent<S>) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // -- internals --

    fn find_transition(&self, from: S, to: S, context: &C) -> Option<usize> {
        self.transitions.iter().position(|t| {
            t.to == to && t.from.contains(&from) && t.guard.as_ref().is_none_or(|g| g(context))
        })
    }

    fn run_hooks(&self, from: S, to: S, index: usize, working: &mut C) -> Result<(), String> {
        if let Some(hook) = self.states.get(&from).and_then(|s| s.on_exit.as_ref()) {
            hook(working)?;
        }
        self.events.publish(&MachineEvent::StateExited { state: from });

        if let Some(action) = self.transitions.get(index).and_then(|t| t.action.as_ref()) {
            action(working, from, to)?;
        }

        if let Some(hook) = self.states.get(&to).and_then(|s| s.on_enter.as_ref()) {
            hook(working)?;
        }
        self.events.publish(&MachineEvent::StateEntered { state: to });
        Ok(())
    }

    fn lock_serial(&self) -> std::sync::MutexGuard<'_, ()> {
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_runtime(&self) -> std::sync::MutexGuard<'_, Runtime<S, C>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Debug, C> Debug for StateMachine<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("initial", &self.initial)
            .field("states", &self.states.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}
