use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

pub trait MachineState: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> MachineState for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Highest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateMatch<S> {
    Any,
    Named(S),
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

type StateHandler<S> = Box<dyn Fn(StateMachineHandle<S>) -> HandlerFuture + Send + Sync>;
type TransitionHook = Box<dyn Fn() -> HandlerFuture + Send + Sync>;
type ErrorListener = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

const DEFAULT_PAUSE_AFTER_ERROR: std::time::Duration = std::time::Duration::from_millis(2000);

#[derive(Debug, Clone)]
struct DesiredState<S> {
    state: S,
    priority: Priority,
}

struct Control<S> {
    name: String,
    current: Mutex<S>,
    desired: Mutex<Option<DesiredState<S>>>,
    stop_requested: AtomicBool,
    running: watch::Sender<bool>,
}

pub struct StateMachineHandle<S> {
    control: Arc<Control<S>>,
}

pub struct StateMachine<S, I = ()> {
    control: Arc<Control<S>>,
    handlers: HashMap<S, StateHandler<S>>,
    hooks: HashMap<(StateMatch<S>, StateMatch<S>), TransitionHook>,
    error_listeners: Vec<ErrorListener>,
    interface: Option<I>,
    pause_after_error: std::time::Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S> Clone for StateMachineHandle<S> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
        }
    }
}

impl<S: MachineState> StateMachineHandle<S> {
    pub fn current_state(&self) -> S {
        lock(&self.control.current).clone()
    }

    #[cfg(test)]
    pub fn desired_state(&self) -> Option<(S, Priority)> {
        lock(&self.control.desired)
            .as_ref()
            .map(|d| (d.state.clone(), d.priority))
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        *self.control.running.borrow()
    }

    pub fn change_state(&self, state: S) {
        self.change_state_with_priority(state, Priority::Normal);
    }

    /// Records `state` as the desired state. A pending `Highest` request can
    /// only be replaced by another `Highest` request until it is serviced.
    pub fn change_state_with_priority(&self, state: S, priority: Priority) {
        let mut desired = lock(&self.control.desired);

        if let Some(pending) = desired.as_ref() {
            if pending.state == state && pending.priority >= priority {
                tracing::info!(
                    "{}: duplicate request to transition to state {:?}",
                    self.control.name,
                    state
                );
                return;
            }

            if pending.priority == Priority::Highest && priority == Priority::Normal {
                tracing::debug!(
                    "{}: ignoring request for {:?}, {:?} is pending with highest priority",
                    self.control.name,
                    state,
                    pending.state
                );
                return;
            }
        }

        *desired = Some(DesiredState { state, priority });
    }

    /// Requests the loop to exit and waits until it has. A handler that is
    /// already executing runs to completion first.
    pub async fn stop(&self) {
        tracing::info!("{}: stopping", self.control.name);
        self.control.stop_requested.store(true, Ordering::SeqCst);

        let mut running = self.control.running.subscribe();
        //sender lives in control, which we hold
        let _ = running.wait_for(|running| !*running).await;

        tracing::info!("{}: stopped", self.control.name);
    }

    fn take_transition(&self) -> Option<(S, DesiredState<S>)> {
        let current = self.current_state();
        let mut desired = lock(&self.control.desired);

        match desired.take() {
            Some(d) if d.state != current => Some((current, d)),
            _ => None,
        }
    }
}

impl<S: MachineState> StateMachine<S, ()> {
    pub fn new(name: impl Into<String>, initial: S) -> Self {
        let (running, _) = watch::channel(false);

        Self {
            control: Arc::new(Control {
                name: name.into(),
                current: Mutex::new(initial),
                desired: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                running,
            }),
            handlers: HashMap::new(),
            hooks: HashMap::new(),
            error_listeners: vec![],
            interface: None,
            pause_after_error: DEFAULT_PAUSE_AFTER_ERROR,
        }
    }

    pub fn with_interface<I>(self, interface: I) -> StateMachine<S, I> {
        StateMachine {
            control: self.control,
            handlers: self.handlers,
            hooks: self.hooks,
            error_listeners: self.error_listeners,
            interface: Some(interface),
            pause_after_error: self.pause_after_error,
        }
    }
}

impl<S: MachineState, I> StateMachine<S, I> {
    pub fn with_pause_after_error(mut self, pause: std::time::Duration) -> Self {
        self.pause_after_error = pause;
        self
    }

    pub fn handle(&self) -> StateMachineHandle<S> {
        StateMachineHandle {
            control: self.control.clone(),
        }
    }

    pub fn add_handler<F, Fut>(&mut self, state: S, handler: F)
    where
        F: Fn(StateMachineHandle<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.handlers.contains_key(&state) {
            tracing::warn!("{}: replacing handler for state {:?}", self.control.name, state);
        }

        self.handlers.insert(state, Box::new(move |handle| handler(handle).boxed()));
    }

    pub fn add_transition_hook<F, Fut>(&mut self, from: StateMatch<S>, to: StateMatch<S>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.insert((from, to), Box::new(move || hook().boxed()));
    }

    pub fn on_error<F>(&mut self, listener: F)
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.error_listeners.push(Box::new(listener));
    }

    pub fn interface(&self) -> anyhow::Result<&I> {
        self.interface
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("State machine {} has no interface", self.control.name))
    }

    pub async fn run(self) {
        let handle = self.handle();
        self.control.running.send_replace(true);
        tracing::info!("{}: running in state {:?}", self.control.name, handle.current_state());

        while !self.control.stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.step(&handle).await {
                self.notify_error(&e);
                tokio::time::sleep(self.pause_after_error).await;
            }
        }

        self.control.running.send_replace(false);
    }

    async fn step(&self, handle: &StateMachineHandle<S>) -> anyhow::Result<()> {
        match handle.take_transition() {
            Some((current, desired)) => {
                self.transition(current, desired.state).await;
                Ok(())
            }
            None => self.execute_handler(handle).await,
        }
    }

    async fn transition(&self, from: S, to: S) {
        let keys = [
            (StateMatch::Named(from.clone()), StateMatch::Any),
            (StateMatch::Named(from.clone()), StateMatch::Named(to.clone())),
            (StateMatch::Any, StateMatch::Named(to.clone())),
        ];
        let hooks: Vec<&TransitionHook> = keys.iter().filter_map(|key| self.hooks.get(key)).collect();

        if !hooks.is_empty() {
            tracing::info!("{}: transitioning from {:?} to {:?}", self.control.name, from, to);
        }

        for hook in hooks {
            if let Err(e) = hook().await {
                tracing::error!(
                    "{}: error transitioning from {:?} to {:?}: {:?}",
                    self.control.name,
                    from,
                    to,
                    e
                );
                return;
            }
        }

        tracing::info!("{}: state {:?}", self.control.name, to);
        *lock(&self.control.current) = to;
    }

    async fn execute_handler(&self, handle: &StateMachineHandle<S>) -> anyhow::Result<()> {
        let state = handle.current_state();

        match self.handlers.get(&state) {
            Some(handler) => handler(handle.clone()).await,
            None => anyhow::bail!("No handler is registered for state {:?}", state),
        }
    }

    fn notify_error(&self, error: &anyhow::Error) {
        if self.error_listeners.is_empty() {
            tracing::error!("{}: unexpected error: {:?}", self.control.name, error);
            return;
        }

        for listener in &self.error_listeners {
            listener(error);
        }
    }
}
