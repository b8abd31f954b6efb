// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Generic Resource State Machine
//!
//! Every recoverable resource (channel, topology, consumer, producer) keeps its
//! lifecycle state in a [`StateMachine`]. The machine stores exactly one value
//! of a closed enumeration, swaps it atomically and runs a transition hook
//! after each effective change.
//!
//! The core does not serialize the *decision* to transition: callers that race
//! on the same decision must guard it themselves. It only guarantees that the
//! stored value is never observed torn and that a terminal state is never left.

use std::{fmt::Debug, sync::Arc};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// A closed set of lifecycle states.
pub trait LinkState: Copy + Eq + Debug + Send + Sync + 'static {
    /// Terminal states can be entered but never left.
    fn is_terminal(&self) -> bool;
}

/// Application callback invoked with `(from, to)` after every transition.
pub type StateHandler<S> = Arc<dyn Fn(S, S) + Send + Sync>;

/// Post-transition notification strategy.
pub trait StateHook<S>: Send + Sync {
    /// Called after the stored state moved from `from` to `to`.
    fn on_state_change(&self, _from: S, _to: S) {}
}

/// Hook that does nothing.
pub struct NoopStateHook;

impl<S> StateHook<S> for NoopStateHook {}

/// Hook that logs each transition at debug level, tagged with the resource
/// kind and identity, then forwards it to an optional application handler.
pub struct LoggingStateHook<S> {
    resource: &'static str,
    id: Uuid,
    handler: Option<StateHandler<S>>,
}

impl<S> LoggingStateHook<S> {
    pub fn new(resource: &'static str, id: Uuid, handler: Option<StateHandler<S>>) -> Self {
        LoggingStateHook {
            resource,
            id,
            handler,
        }
    }
}

impl<S: LinkState> StateHook<S> for LoggingStateHook<S> {
    fn on_state_change(&self, from: S, to: S) {
        debug!(
            resource = self.resource,
            id = self.id.to_string(),
            "state change {:?} -> {:?}",
            from,
            to
        );

        if let Some(handler) = &self.handler {
            handler(from, to);
        }
    }
}

/// Thread-safe single-slot holder of the current state of a resource.
///
/// The slot is a `watch` channel so that observers can [`subscribe`](Self::subscribe)
/// to changes without registering callbacks on the resource itself.
pub struct StateMachine<S: LinkState> {
    state: watch::Sender<S>,
    hook: Box<dyn StateHook<S>>,
}

impl<S: LinkState> StateMachine<S> {
    /// Creates a state machine with a no-op transition hook.
    pub fn new(initial: S) -> Self {
        Self::with_hook(initial, NoopStateHook)
    }

    /// Creates a state machine with the given transition hook.
    pub fn with_hook<H>(initial: S, hook: H) -> Self
    where
        H: StateHook<S> + 'static,
    {
        StateMachine {
            state: watch::Sender::new(initial),
            hook: Box::new(hook),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> S {
        *self.state.borrow()
    }

    /// Atomically moves to `next`.
    ///
    /// Returns `false` (and does not notify) when the machine already is in
    /// `next` or sits in a terminal state.
    pub fn change_state(&self, next: S) -> bool {
        self.transition(|_| true, next)
    }

    /// Atomically moves to `next` only when the current state is `expected`.
    pub fn compare_and_change(&self, expected: S, next: S) -> bool {
        self.transition(|current| current == expected, next)
    }

    /// Subscribes to state changes.
    ///
    /// Receivers only observe the latest value; intermediate states may be
    /// skipped by slow observers. Use a [`StateHook`] to see every transition.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    fn transition<F>(&self, guard: F, next: S) -> bool
    where
        F: FnOnce(S) -> bool,
    {
        let mut previous = None;

        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next || !guard(*current) {
                return false;
            }

            previous = Some(*current);
            *current = next;
            true
        });

        match previous {
            Some(from) => {
                self.hook.on_state_change(from, next);
                true
            }
            None => false,
        }
    }
}

/// Lifecycle of a topology object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyState {
    Init,
    Configuring,
    Ready,
    Reconfiguring,
    Stopping,
    Disposed,
}

impl LinkState for TopologyState {
    fn is_terminal(&self) -> bool {
        matches!(self, TopologyState::Disposed)
    }
}

/// Lifecycle of a recovering channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Init,
    Connecting,
    Active,
    Stopping,
    Reopening,
    Disposed,
}

impl LinkState for ChannelState {
    fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Disposed)
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Init,
    Configuring,
    Reconfiguring,
    Active,
    Stopping,
    Disposed,
}

impl LinkState for ConsumerState {
    fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Disposed)
    }
}

/// Lifecycle of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerState {
    Init,
    Configuring,
    Reconfiguring,
    Active,
    Stopping,
    Disposed,
}

impl LinkState for ProducerState {
    fn is_terminal(&self) -> bool {
        matches!(self, ProducerState::Disposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHook(Arc<Mutex<Vec<(TopologyState, TopologyState)>>>);

    impl StateHook<TopologyState> for RecordingHook {
        fn on_state_change(&self, from: TopologyState, to: TopologyState) {
            self.0.lock().unwrap().push((from, to));
        }
    }

    #[test]
    fn should_notify_hook_after_each_change() {
        let seen = Arc::new(Mutex::new(vec![]));
        let machine = StateMachine::with_hook(TopologyState::Init, RecordingHook(seen.clone()));

        assert!(machine.change_state(TopologyState::Configuring));
        assert!(machine.change_state(TopologyState::Ready));

        assert_eq!(machine.state(), TopologyState::Ready);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TopologyState::Init, TopologyState::Configuring),
                (TopologyState::Configuring, TopologyState::Ready),
            ]
        );
    }

    #[test]
    fn should_skip_notification_when_state_is_unchanged() {
        let seen = Arc::new(Mutex::new(vec![]));
        let machine = StateMachine::with_hook(TopologyState::Init, RecordingHook(seen.clone()));

        assert!(!machine.change_state(TopologyState::Init));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn should_never_leave_terminal_state() {
        let machine = StateMachine::new(TopologyState::Ready);

        assert!(machine.change_state(TopologyState::Disposed));
        assert!(!machine.change_state(TopologyState::Init));
        assert!(!machine.compare_and_change(TopologyState::Disposed, TopologyState::Ready));
        assert_eq!(machine.state(), TopologyState::Disposed);
    }

    #[test]
    fn should_compare_before_changing() {
        let machine = StateMachine::new(ChannelState::Init);

        assert!(!machine.compare_and_change(ChannelState::Active, ChannelState::Stopping));
        assert!(machine.compare_and_change(ChannelState::Init, ChannelState::Connecting));
        assert_eq!(machine.state(), ChannelState::Connecting);
    }

    #[tokio::test]
    async fn should_publish_changes_to_subscribers() {
        let machine = StateMachine::new(ConsumerState::Init);
        let mut rx = machine.subscribe();

        machine.change_state(ConsumerState::Active);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConsumerState::Active);
    }

    #[test]
    fn should_forward_transitions_to_application_handler() {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let handler: StateHandler<ProducerState> = Arc::new(move |from, to| {
            sink.lock().unwrap().push((from, to));
        });

        let machine = StateMachine::with_hook(
            ProducerState::Init,
            LoggingStateHook::new("producer", Uuid::new_v4(), Some(handler)),
        );
        machine.change_state(ProducerState::Configuring);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ProducerState::Init, ProducerState::Configuring)]
        );
    }
}
