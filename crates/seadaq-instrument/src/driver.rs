//! The connection-layer state machine and the public driver facade.
//!
//! An [`InstrumentDriver`] tracks whether a transport is configured and
//! open, and owns the [`Protocol`] session while connected. Transport
//! lifecycle events run on the driver machine; everything
//! instrument-facing is forwarded into the protocol machine while the
//! driver machine's mutex is held, so a disconnect can never interleave
//! with a half-dispatched command.
//!
//! Connecting deliberately stops at [`ConnectionState::Connected`] with
//! the protocol in its unknown state; call
//! [`InstrumentDriver::discover`] to find the instrument's mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use seadaq_core::fsm::{Handled, MachineBuilder, MachineEvent, SharedMachine, StateMachine};
use seadaq_core::{
    notification_channel, DriverResult, InstrumentError, Notification, NotificationKind,
    NotificationReceiver, NotificationSender,
};

use crate::connection::{data_channel, share, Connection, SharedConnection};
use crate::protocol::{EventArgs, Protocol, ProtocolBuilder, ProtocolEvent, ProtocolState};
use crate::settings::ProtocolSettings;

//============================================================
// States and events
//============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport configured.
    Unconfigured,
    /// Transport configured but not open.
    Disconnected,
    /// Transport open with a live protocol session.
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Enter,
    Exit,
    /// Forget the configured transport.
    Initialize,
    /// Adopt the transport staged in the context.
    Configure,
    Connect,
    Disconnect,
    /// The transport's read side went away.
    ConnectionLost,
    /// Forward the wrapped protocol event to the session.
    Resource,
}

impl MachineEvent for ConnectionEvent {
    fn enter() -> Self {
        ConnectionEvent::Enter
    }
    fn exit() -> Self {
        ConnectionEvent::Exit
    }
}

/// Builds a fresh protocol description for each connect; sessions are
/// not reused across connections.
pub type ProtocolFactory = Box<dyn Fn() -> ProtocolBuilder + Send + Sync>;

//============================================================
// Machine context
//============================================================

struct DriverCtx {
    /// Transport parked by `configure` for the Configure handler.
    staged_conn: Option<Box<dyn Connection>>,
    conn: Option<SharedConnection>,
    protocol: Option<Protocol>,
    protocol_factory: ProtocolFactory,
    settings: ProtocolSettings,
    notifier: NotificationSender,
    lost_tx: mpsc::UnboundedSender<()>,
}

impl DriverCtx {
    fn announce(&self, state: ConnectionState) {
        let _ = self
            .notifier
            .send(Notification::new(NotificationKind::StateChange, json!(state)));
    }

    async fn on_enter_unconfigured(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ConnectionState>> {
        self.announce(ConnectionState::Unconfigured);
        Ok(Handled::stay())
    }

    /// Legal in both Unconfigured and Disconnected; staying in
    /// Disconnected just swaps the transport.
    async fn on_configure(&mut self, _args: EventArgs) -> DriverResult<Handled<ConnectionState>> {
        let staged = self.staged_conn.take().ok_or_else(|| {
            InstrumentError::Configuration("no transport staged for configure".into())
        })?;
        self.conn = Some(share(staged));
        Ok(Handled::transition(ConnectionState::Disconnected))
    }

    async fn on_enter_disconnected(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ConnectionState>> {
        self.announce(ConnectionState::Disconnected);
        Ok(Handled::stay())
    }

    async fn on_initialize(&mut self, _args: EventArgs) -> DriverResult<Handled<ConnectionState>> {
        self.conn = None;
        Ok(Handled::transition(ConnectionState::Unconfigured))
    }

    async fn on_connect(&mut self, _args: EventArgs) -> DriverResult<Handled<ConnectionState>> {
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| InstrumentError::Configuration("no transport configured".into()))?;
        let (sink, stream) = data_channel();
        {
            let mut transport = conn.lock().await;
            transport.open(sink).await?;
        }
        let builder = (self.protocol_factory)();
        let protocol = Protocol::start(
            builder,
            self.settings.clone(),
            Arc::clone(&conn),
            stream,
            self.lost_tx.clone(),
            self.notifier.clone(),
        )
        .await?;
        self.protocol = Some(protocol);
        Ok(Handled::transition(ConnectionState::Connected))
    }

    async fn on_enter_connected(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ConnectionState>> {
        self.announce(ConnectionState::Connected);
        Ok(Handled::stay())
    }

    async fn teardown(&mut self) {
        if let Some(protocol) = self.protocol.take() {
            protocol.stop().await;
        }
        if let Some(conn) = &self.conn {
            let mut transport = conn.lock().await;
            if let Err(e) = transport.close().await {
                warn!(error = %e, "transport close failed");
            }
        }
    }

    async fn on_disconnect(&mut self, _args: EventArgs) -> DriverResult<Handled<ConnectionState>> {
        self.teardown().await;
        Ok(Handled::transition(ConnectionState::Disconnected))
    }

    async fn on_connection_lost(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ConnectionState>> {
        warn!("transport dropped while connected");
        self.teardown().await;
        let _ = self.notifier.send(Notification::new(
            NotificationKind::Error,
            json!({ "error": "connection lost" }),
        ));
        Ok(Handled::transition(ConnectionState::Disconnected))
    }

    async fn on_resource(&mut self, args: EventArgs) -> DriverResult<Handled<ConnectionState>> {
        let EventArgs::Forward { event, args } = args else {
            return Err(InstrumentError::Protocol(
                "resource dispatch needs a forwarded event".into(),
            ));
        };
        let protocol = self
            .protocol
            .as_ref()
            .ok_or_else(|| InstrumentError::Configuration("no active protocol session".into()))?;
        let value = protocol.dispatch(event, *args).await?;
        Ok(Handled::with_result(value))
    }
}

//============================================================
// Machine assembly
//============================================================

macro_rules! route {
    ($builder:expr, $state:expr, $event:expr, $method:ident) => {
        $builder.handler(
            $state,
            $event,
            Box::new(|c, a| Box::pin(DriverCtx::$method(c, a))),
        )
    };
}

fn build_machine() -> StateMachine<DriverCtx, ConnectionState, ConnectionEvent, EventArgs> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let mut builder = MachineBuilder::new();
    builder = route!(builder, S::Unconfigured, E::Enter, on_enter_unconfigured);
    builder = route!(builder, S::Unconfigured, E::Configure, on_configure);

    builder = route!(builder, S::Disconnected, E::Enter, on_enter_disconnected);
    builder = route!(builder, S::Disconnected, E::Configure, on_configure);
    builder = route!(builder, S::Disconnected, E::Initialize, on_initialize);
    builder = route!(builder, S::Disconnected, E::Connect, on_connect);

    builder = route!(builder, S::Connected, E::Enter, on_enter_connected);
    builder = route!(builder, S::Connected, E::Disconnect, on_disconnect);
    builder = route!(builder, S::Connected, E::ConnectionLost, on_connection_lost);
    builder = route!(builder, S::Connected, E::Resource, on_resource);
    builder.build()
}

//============================================================
// Public facade
//============================================================

/// One instrument port: transport lifecycle plus the instrument-facing
/// operations of the active session.
pub struct InstrumentDriver {
    fsm: SharedMachine<DriverCtx, ConnectionState, ConnectionEvent, EventArgs>,
    notifier: NotificationSender,
    watch: JoinHandle<()>,
}

impl InstrumentDriver {
    /// Create a driver in [`ConnectionState::Unconfigured`] and hand
    /// back the first notification subscription.
    pub async fn new(
        protocol_factory: ProtocolFactory,
        settings: ProtocolSettings,
    ) -> (Self, NotificationReceiver) {
        let (notifier, receiver) = notification_channel(256);
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let ctx = DriverCtx {
            staged_conn: None,
            conn: None,
            protocol: None,
            protocol_factory,
            settings,
            notifier: notifier.clone(),
            lost_tx,
        };
        let fsm = SharedMachine::new(build_machine(), ctx);
        fsm.start(ConnectionState::Unconfigured).await;

        let watch_fsm = fsm.clone();
        let watch = tokio::spawn(async move {
            while lost_rx.recv().await.is_some() {
                let result = watch_fsm
                    .on_event(ConnectionEvent::ConnectionLost, EventArgs::None)
                    .await;
                if let Err(e) = result {
                    // A deliberate disconnect usually wins this race.
                    debug!(error = %e, "connection-lost event not applicable");
                }
            }
        });

        (
            Self {
                fsm,
                notifier,
                watch,
            },
            receiver,
        )
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.notifier.subscribe()
    }

    /// Hand the driver its transport. Allowed while unconfigured or
    /// disconnected; replaces any previous transport.
    pub async fn configure(&self, connection: Box<dyn Connection>) -> DriverResult<()> {
        self.fsm
            .with_ctx(|ctx| ctx.staged_conn = Some(connection))
            .await;
        let result = self
            .fsm
            .on_event(ConnectionEvent::Configure, EventArgs::None)
            .await;
        if result.is_err() {
            self.fsm.with_ctx(|ctx| ctx.staged_conn = None).await;
        }
        result.map(|_| ())
    }

    /// Drop the configured transport, returning to unconfigured.
    pub async fn initialize(&self) -> DriverResult<()> {
        self.fsm
            .on_event(ConnectionEvent::Initialize, EventArgs::None)
            .await
            .map(|_| ())
    }

    /// Open the transport and start a protocol session. The protocol
    /// comes up in its unknown state; no discovery is attempted.
    pub async fn connect(&self) -> DriverResult<()> {
        self.fsm
            .on_event(ConnectionEvent::Connect, EventArgs::None)
            .await
            .map(|_| ())
    }

    /// Stop the session and close the transport.
    pub async fn disconnect(&self) -> DriverResult<()> {
        self.fsm
            .on_event(ConnectionEvent::Disconnect, EventArgs::None)
            .await
            .map(|_| ())
    }

    async fn resource(&self, event: ProtocolEvent, args: EventArgs) -> DriverResult<Value> {
        self.fsm
            .on_event(
                ConnectionEvent::Resource,
                EventArgs::Forward {
                    event,
                    args: Box::new(args),
                },
            )
            .await
    }

    /// Probe the connected instrument for its mode; resolves to the
    /// protocol state discovery landed in.
    pub async fn discover(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::Discover, EventArgs::None).await
    }

    /// Put the protocol into `state` without probing the instrument.
    /// Only valid instead of discovery, not after it.
    pub async fn force_state(&self, state: ProtocolState) -> DriverResult<Value> {
        self.resource(ProtocolEvent::ForceState, EventArgs::State(state))
            .await
    }

    /// Read parameters. An empty name list means all of them. Served
    /// from the parameter store without touching the instrument.
    pub async fn get_resource(&self, names: Vec<String>) -> DriverResult<Value> {
        self.resource(ProtocolEvent::Get, EventArgs::Names(names))
            .await
    }

    /// Write parameters, pushing the new configuration to the
    /// instrument when anything actually changed.
    pub async fn set_resource(&self, settings: BTreeMap<String, Value>) -> DriverResult<Value> {
        self.resource(ProtocolEvent::Set, EventArgs::Settings(settings))
            .await
    }

    /// Run a named instrument command and return its parsed response.
    pub async fn execute_resource(&self, command: &str) -> DriverResult<Value> {
        self.resource(ProtocolEvent::Execute, EventArgs::Command(command.to_owned()))
            .await
    }

    pub async fn acquire_sample(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::AcquireSample, EventArgs::None)
            .await
    }

    pub async fn acquire_status(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::AcquireStatus, EventArgs::None)
            .await
    }

    pub async fn clock_sync(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::ClockSync, EventArgs::None).await
    }

    pub async fn start_autosample(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::StartAutosample, EventArgs::None)
            .await
    }

    pub async fn stop_autosample(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::StopAutosample, EventArgs::None)
            .await
    }

    pub async fn start_direct(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::StartDirect, EventArgs::None)
            .await
    }

    pub async fn stop_direct(&self) -> DriverResult<Value> {
        self.resource(ProtocolEvent::StopDirect, EventArgs::None).await
    }

    /// Pass raw bytes through an active direct-access session.
    pub async fn execute_direct(&self, data: Bytes) -> DriverResult<Value> {
        self.resource(ProtocolEvent::ExecuteDirect, EventArgs::Raw(data))
            .await
    }

    /// The protocol state while a session is active, the connection
    /// state otherwise.
    pub async fn get_resource_state(&self) -> Value {
        let session = self
            .fsm
            .with_ctx(|ctx| ctx.protocol.as_ref().map(|p| p.fsm.clone()))
            .await;
        if let Some(fsm) = session {
            if let Some(state) = fsm.state().await {
                return json!(state);
            }
        }
        match self.fsm.state().await {
            Some(state) => json!(state),
            None => Value::Null,
        }
    }

    /// Protocol events dispatchable right now, sorted. Empty when no
    /// session is active.
    pub async fn capabilities(&self) -> Vec<ProtocolEvent> {
        let session = self
            .fsm
            .with_ctx(|ctx| ctx.protocol.as_ref().map(|p| p.fsm.clone()))
            .await;
        let Some(fsm) = session else {
            return Vec::new();
        };
        let Some(state) = fsm.state().await else {
            return Vec::new();
        };
        let mut events = fsm.events_in(state).await;
        events.retain(|e| !matches!(e, ProtocolEvent::Enter | ProtocolEvent::Exit));
        events.sort();
        events
    }
}

impl Drop for InstrumentDriver {
    fn drop(&mut self) {
        self.watch.abort();
    }
}
