//! Generic `(state, event) → handler` dispatch with enter/exit semantics.
//!
//! A [`StateMachine`] owns an explicit transition table populated once at
//! construction through [`MachineBuilder`]; nothing is looked up
//! dynamically at dispatch time beyond the table itself. Handlers are
//! async and borrow a caller-supplied context for the duration of one
//! dispatch, so the machine itself stays free of domain state.
//!
//! [`SharedMachine`] bundles a machine with its context behind one
//! `tokio::sync::Mutex`, held for the full duration of `on_event`
//! including any enter/exit handlers and nested dispatches the handler
//! performs. That single lock is what serializes concurrent callers,
//! scheduler timers, and reader-driven events onto one machine.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DriverResult, InstrumentError};

/// States usable as machine keys. Blanket-implemented for any suitable
/// enum; the declared state set is the enum itself, so the current state
/// can never leave it.
pub trait MachineState: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> MachineState for T {}

/// Events usable as machine keys. Each event enum names its two
/// lifecycle pseudo-events; they share the transition table with the
/// ordinary events.
pub trait MachineEvent: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Pseudo-event dispatched after a transition lands in a state.
    fn enter() -> Self;
    /// Pseudo-event dispatched before a transition leaves a state.
    fn exit() -> Self;
}

/// What a handler hands back: where to go next (`None` means stay) and
/// the caller-visible result of the dispatch.
#[derive(Debug)]
pub struct Handled<S> {
    /// State to transition to; `None` or the current state means no
    /// transition.
    pub next_state: Option<S>,
    /// Result returned to the `on_event` caller.
    pub result: serde_json::Value,
    /// Run the exit and enter handlers around the transition. Cleared
    /// by [`jump_with`](Self::jump_with).
    pub lifecycle: bool,
}

impl<S> Handled<S> {
    /// Stay in the current state with a null result.
    pub fn stay() -> Self {
        Self {
            next_state: None,
            result: serde_json::Value::Null,
            lifecycle: true,
        }
    }

    /// Stay in the current state and return `result`.
    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            next_state: None,
            result,
            lifecycle: true,
        }
    }

    /// Transition to `next` with a null result.
    pub fn transition(next: S) -> Self {
        Self {
            next_state: Some(next),
            result: serde_json::Value::Null,
            lifecycle: true,
        }
    }

    /// Transition to `next` and return `result`.
    pub fn transition_with(next: S, result: serde_json::Value) -> Self {
        Self {
            next_state: Some(next),
            result,
            lifecycle: true,
        }
    }

    /// Move to `next` and return `result` without firing the exit or
    /// enter handlers on the way. For forcing a state from outside the
    /// normal flow; ordinary transitions should let the lifecycle run.
    pub fn jump_with(next: S, result: serde_json::Value) -> Self {
        Self {
            next_state: Some(next),
            result,
            lifecycle: false,
        }
    }
}

/// Boxed async event handler. The future borrows the context for the
/// duration of the dispatch; register with
/// `Box::new(|ctx, args| Box::pin(ctx.some_handler(args)))`.
pub type Handler<C, S, A> =
    Box<dyn for<'c> Fn(&'c mut C, A) -> BoxFuture<'c, DriverResult<Handled<S>>> + Send + Sync>;

/// Builds a [`StateMachine`]'s transition table. Registering the same
/// `(state, event)` pair twice overwrites the earlier handler.
pub struct MachineBuilder<C, S, E, A> {
    table: HashMap<(S, E), Handler<C, S, A>>,
}

impl<C, S, E, A> MachineBuilder<C, S, E, A>
where
    S: MachineState,
    E: MachineEvent,
{
    /// Start an empty table.
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register `handler` for `(state, event)`.
    pub fn handler(mut self, state: S, event: E, handler: Handler<C, S, A>) -> Self {
        if self.table.insert((state, event), handler).is_some() {
            debug!(?state, ?event, "handler overwritten");
        }
        self
    }

    /// Finish the table. The machine starts with no current state; call
    /// [`StateMachine::start`] before dispatching.
    pub fn build(self) -> StateMachine<C, S, E, A> {
        StateMachine {
            table: self.table,
            current: None,
        }
    }
}

impl<C, S, E, A> Default for MachineBuilder<C, S, E, A>
where
    S: MachineState,
    E: MachineEvent,
{
    fn default() -> Self {
        Self::new()
    }
}

/// An explicit-table finite-state machine.
pub struct StateMachine<C, S, E, A> {
    table: HashMap<(S, E), Handler<C, S, A>>,
    current: Option<S>,
}

impl<C, S, E, A> StateMachine<C, S, E, A>
where
    S: MachineState,
    E: MachineEvent,
    A: Default + Send + 'static,
{
    /// Set the current state without dispatching an enter handler.
    pub fn start(&mut self, state: S) {
        self.current = Some(state);
    }

    /// Current state, or `None` before [`start`](Self::start).
    pub fn state(&self) -> Option<S> {
        self.current
    }

    /// Whether a handler is registered for `(state, event)`.
    pub fn has_handler(&self, state: S, event: E) -> bool {
        self.table.contains_key(&(state, event))
    }

    /// Events with a handler in `state`, in table order.
    pub fn events_in(&self, state: S) -> Vec<E> {
        self.table
            .keys()
            .filter(|(s, _)| *s == state)
            .map(|(_, e)| *e)
            .collect()
    }

    /// Dispatch `event` with `args`.
    ///
    /// Fails with [`InstrumentError::State`] when the current state has
    /// no handler for the event, leaving the state unchanged. When the
    /// handler requests a transition, the old state's exit handler runs,
    /// the state is updated, then the new state's enter handler runs,
    /// all before this call returns. Lifecycle handlers cannot
    /// themselves redirect the transition; their `next_state` is
    /// ignored. An error from the exit handler aborts the transition
    /// with the state unchanged; an error from the enter handler
    /// propagates after the state has already moved. A jump
    /// ([`Handled::jump_with`]) moves the state without running either
    /// lifecycle handler.
    pub async fn on_event(
        &mut self,
        ctx: &mut C,
        event: E,
        args: A,
    ) -> DriverResult<serde_json::Value> {
        let current = self
            .current
            .ok_or_else(|| InstrumentError::Configuration("state machine not started".into()))?;

        let handler = self
            .table
            .get(&(current, event))
            .ok_or_else(|| InstrumentError::state(&current, &event))?;

        let handled = handler(ctx, args).await?;

        if let Some(next) = handled.next_state {
            if next != current {
                if handled.lifecycle {
                    debug!(from = ?current, to = ?next, via = ?event, "state transition");
                    if let Some(exit) = self.table.get(&(current, E::exit())) {
                        exit(ctx, A::default()).await?;
                    }
                    self.current = Some(next);
                    if let Some(enter) = self.table.get(&(next, E::enter())) {
                        enter(ctx, A::default()).await?;
                    }
                } else {
                    debug!(from = ?current, to = ?next, via = ?event, "state jump");
                    self.current = Some(next);
                }
            }
        }

        Ok(handled.result)
    }
}

/// A machine and its context behind one mutex.
///
/// Cloning is shallow; all clones dispatch onto the same machine, and
/// the mutex guarantees no two dispatches overlap.
pub struct SharedMachine<C, S, E, A> {
    inner: Arc<Mutex<SharedCore<C, S, E, A>>>,
}

struct SharedCore<C, S, E, A> {
    machine: StateMachine<C, S, E, A>,
    ctx: C,
}

impl<C, S, E, A> SharedMachine<C, S, E, A>
where
    C: Send + 'static,
    S: MachineState,
    E: MachineEvent,
    A: Default + Send + 'static,
{
    /// Pair a built machine with its context.
    pub fn new(machine: StateMachine<C, S, E, A>, ctx: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedCore { machine, ctx })),
        }
    }

    /// Set the current state without dispatching an enter handler.
    pub async fn start(&self, state: S) {
        self.inner.lock().await.machine.start(state);
    }

    /// Current state, or `None` before start.
    pub async fn state(&self) -> Option<S> {
        self.inner.lock().await.machine.state()
    }

    /// Events with a handler in `state`.
    pub async fn events_in(&self, state: S) -> Vec<E> {
        self.inner.lock().await.machine.events_in(state)
    }

    /// Serialized dispatch; see [`StateMachine::on_event`]. The internal
    /// mutex is held until the handler and any enter/exit handlers have
    /// completed.
    pub async fn on_event(&self, event: E, args: A) -> DriverResult<serde_json::Value> {
        let mut core = self.inner.lock().await;
        let SharedCore { machine, ctx } = &mut *core;
        machine.on_event(ctx, event, args).await
    }

    /// Run `f` against the context under the machine's mutex.
    pub async fn with_ctx<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut core = self.inner.lock().await;
        f(&mut core.ctx)
    }
}

impl<C, S, E, A> Clone for SharedMachine<C, S, E, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestState {
        Idle,
        Busy,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestEvent {
        Enter,
        Exit,
        Go,
        Halt,
        Ping,
    }

    impl MachineEvent for TestEvent {
        fn enter() -> Self {
            TestEvent::Enter
        }
        fn exit() -> Self {
            TestEvent::Exit
        }
    }

    #[derive(Default)]
    struct Trace {
        calls: Vec<&'static str>,
    }

    async fn go(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
        ctx.calls.push("go");
        Ok(Handled::transition_with(
            TestState::Busy,
            serde_json::json!("went"),
        ))
    }

    async fn idle_exit(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
        ctx.calls.push("idle_exit");
        Ok(Handled::stay())
    }

    async fn busy_enter(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
        ctx.calls.push("busy_enter");
        Ok(Handled::stay())
    }

    async fn ping(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
        ctx.calls.push("ping");
        Ok(Handled::with_result(serde_json::json!("pong")))
    }

    async fn halt(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
        ctx.calls.push("halt");
        Ok(Handled::transition(TestState::Idle))
    }

    fn machine() -> StateMachine<Trace, TestState, TestEvent, ()> {
        MachineBuilder::new()
            .handler(TestState::Idle, TestEvent::Go, Box::new(|c, a| Box::pin(go(c, a))))
            .handler(
                TestState::Idle,
                TestEvent::Exit,
                Box::new(|c, a| Box::pin(idle_exit(c, a))),
            )
            .handler(
                TestState::Busy,
                TestEvent::Enter,
                Box::new(|c, a| Box::pin(busy_enter(c, a))),
            )
            .handler(
                TestState::Busy,
                TestEvent::Ping,
                Box::new(|c, a| Box::pin(ping(c, a))),
            )
            .handler(
                TestState::Busy,
                TestEvent::Halt,
                Box::new(|c, a| Box::pin(halt(c, a))),
            )
            .build()
    }

    #[tokio::test]
    async fn unregistered_event_fails_and_preserves_state() {
        let mut fsm = machine();
        let mut ctx = Trace::default();
        fsm.start(TestState::Idle);

        let err = fsm
            .on_event(&mut ctx, TestEvent::Ping, ())
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::State { .. }));
        assert_eq!(fsm.state(), Some(TestState::Idle));
        assert!(ctx.calls.is_empty());
    }

    #[tokio::test]
    async fn exit_then_enter_exactly_once_before_return() {
        let mut fsm = machine();
        let mut ctx = Trace::default();
        fsm.start(TestState::Idle);

        let result = fsm.on_event(&mut ctx, TestEvent::Go, ()).await.unwrap();
        assert_eq!(result, serde_json::json!("went"));
        assert_eq!(fsm.state(), Some(TestState::Busy));
        assert_eq!(ctx.calls, vec!["go", "idle_exit", "busy_enter"]);
    }

    #[tokio::test]
    async fn jump_bypasses_lifecycle_handlers() {
        async fn leap(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
            ctx.calls.push("leap");
            Ok(Handled::jump_with(
                TestState::Busy,
                serde_json::json!("leapt"),
            ))
        }

        let mut fsm = MachineBuilder::new()
            .handler(
                TestState::Idle,
                TestEvent::Go,
                Box::new(|c, a| Box::pin(leap(c, a))),
            )
            .handler(
                TestState::Idle,
                TestEvent::Exit,
                Box::new(|c, a| Box::pin(idle_exit(c, a))),
            )
            .handler(
                TestState::Busy,
                TestEvent::Enter,
                Box::new(|c, a| Box::pin(busy_enter(c, a))),
            )
            .build();
        let mut ctx = Trace::default();
        fsm.start(TestState::Idle);

        let result = fsm.on_event(&mut ctx, TestEvent::Go, ()).await.unwrap();
        assert_eq!(result, serde_json::json!("leapt"));
        assert_eq!(fsm.state(), Some(TestState::Busy));
        assert_eq!(ctx.calls, vec!["leap"]);
    }

    #[tokio::test]
    async fn staying_put_fires_no_lifecycle_handlers() {
        let mut fsm = machine();
        let mut ctx = Trace::default();
        fsm.start(TestState::Busy);

        let result = fsm.on_event(&mut ctx, TestEvent::Ping, ()).await.unwrap();
        assert_eq!(result, serde_json::json!("pong"));
        assert_eq!(ctx.calls, vec!["ping"]);
        assert_eq!(fsm.state(), Some(TestState::Busy));
    }

    #[tokio::test]
    async fn transition_without_lifecycle_handlers_is_fine() {
        // Busy has no exit handler and Idle has no enter handler.
        let mut fsm = machine();
        let mut ctx = Trace::default();
        fsm.start(TestState::Busy);

        fsm.on_event(&mut ctx, TestEvent::Halt, ()).await.unwrap();
        assert_eq!(fsm.state(), Some(TestState::Idle));
        assert_eq!(ctx.calls, vec!["halt"]);
    }

    #[tokio::test]
    async fn start_does_not_fire_enter() {
        let mut fsm = machine();
        let ctx = Trace::default();
        fsm.start(TestState::Busy);
        assert!(ctx.calls.is_empty());
        assert_eq!(fsm.state(), Some(TestState::Busy));
    }

    #[tokio::test]
    async fn dispatch_before_start_is_rejected() {
        let mut fsm = machine();
        let mut ctx = Trace::default();
        let err = fsm.on_event(&mut ctx, TestEvent::Go, ()).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Configuration(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_overwrites() {
        async fn second(ctx: &mut Trace, _args: ()) -> DriverResult<Handled<TestState>> {
            ctx.calls.push("second");
            Ok(Handled::stay())
        }

        let mut fsm = MachineBuilder::new()
            .handler(
                TestState::Idle,
                TestEvent::Go,
                Box::new(|c, a| Box::pin(go(c, a))),
            )
            .handler(
                TestState::Idle,
                TestEvent::Go,
                Box::new(|c, a| Box::pin(second(c, a))),
            )
            .build();
        let mut ctx = Trace::default();
        fsm.start(TestState::Idle);

        fsm.on_event(&mut ctx, TestEvent::Go, ()).await.unwrap();
        assert_eq!(ctx.calls, vec!["second"]);
    }

    #[tokio::test]
    async fn shared_machine_serializes_concurrent_dispatch() {
        use std::time::Duration;

        async fn slow(ctx: &mut Vec<&'static str>, _args: ()) -> DriverResult<Handled<TestState>> {
            ctx.push("slow-begin");
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.push("slow-end");
            Ok(Handled::stay())
        }

        async fn quick(ctx: &mut Vec<&'static str>, _args: ()) -> DriverResult<Handled<TestState>> {
            ctx.push("quick");
            Ok(Handled::stay())
        }

        let machine = MachineBuilder::new()
            .handler(
                TestState::Idle,
                TestEvent::Go,
                Box::new(|c, a| Box::pin(slow(c, a))),
            )
            .handler(
                TestState::Idle,
                TestEvent::Ping,
                Box::new(|c, a| Box::pin(quick(c, a))),
            )
            .build();
        let shared = SharedMachine::new(machine, Vec::new());
        shared.start(TestState::Idle).await;

        let a = shared.clone();
        let slow_task = tokio::spawn(async move { a.on_event(TestEvent::Go, ()).await });
        // Give the slow dispatch a head start so it owns the mutex first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        shared.on_event(TestEvent::Ping, ()).await.unwrap();
        slow_task.await.unwrap().unwrap();

        let calls = shared.with_ctx(|ctx| ctx.clone()).await;
        assert_eq!(calls, vec!["slow-begin", "slow-end", "quick"]);
    }
}
