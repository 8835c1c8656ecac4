//! The protocol state machine and its command/response engine.
//!
//! A [`Protocol`] is built per connection session from a
//! [`ProtocolBuilder`] describing one instrument family: its prompts,
//! named commands, parameter dict, frame shapes and scheduled
//! housekeeping. The engine supplies the standard behavior: mode
//! discovery, get/set with config write-back, autosample control,
//! clock sync, status sweeps and direct access. Instrument
//! definitions supply the bytes.
//!
//! Two background tasks run alongside the machine: the data pump,
//! which feeds raw reads into the response buffer, the chunker and the
//! sample router, and the event pump, which turns scheduler callbacks
//! into machine events. Neither touches the machine mutex while bytes
//! are merely flowing, so a handler parked inside
//! [`ProtocolCtx::do_cmd_resp`] always sees fresh response bytes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use seadaq_core::fsm::{Handled, Handler, MachineBuilder, MachineEvent, SharedMachine, StateMachine};
use seadaq_core::{
    DriverResult, InstrumentError, Notification, NotificationKind, NotificationSender, Scheduler,
    Trigger,
};

use crate::chunker::{ChunkMatcher, Chunker};
use crate::codec::{self, FrameSpec};
use crate::connection::{DataStream, SharedConnection};
use crate::params::{ParamValue, ParameterDict, UpdateTarget, Visibility};
use crate::sample::{SampleRouter, SampleTemplate};
use crate::settings::ProtocolSettings;

//============================================================
// States, events, arguments
//============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolState {
    Unknown,
    Command,
    Autosample,
    DirectAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolEvent {
    Enter,
    Exit,
    Discover,
    ForceState,
    Get,
    Set,
    Execute,
    AcquireSample,
    AcquireStatus,
    ClockSync,
    ScheduledClockSync,
    ScheduledAcquireStatus,
    StartAutosample,
    StopAutosample,
    StartDirect,
    StopDirect,
    ExecuteDirect,
}

impl MachineEvent for ProtocolEvent {
    fn enter() -> Self {
        ProtocolEvent::Enter
    }
    fn exit() -> Self {
        ProtocolEvent::Exit
    }
}

/// Arguments dispatched with protocol and connection events.
#[derive(Debug, Clone, Default)]
pub enum EventArgs {
    #[default]
    None,
    /// Parameter names for a get; empty means all of them.
    Names(Vec<String>),
    /// Desired parameter values for a set.
    Settings(BTreeMap<String, Value>),
    /// A named instrument command to execute.
    Command(String),
    /// Raw bytes for direct-access passthrough.
    Raw(Bytes),
    /// Target state for a forced transition.
    State(ProtocolState),
    /// Driver-side envelope forwarding a protocol event.
    Forward {
        event: ProtocolEvent,
        args: Box<EventArgs>,
    },
}

//============================================================
// Command specs
//============================================================

/// Bytes a command puts on the wire.
#[derive(Clone)]
pub enum Payload {
    /// Fixed bytes.
    Literal(Bytes),
    /// A command prefix followed by the rendered config frame.
    ConfigFrame { prefix: Bytes },
    /// Computed at send time from the parameter dict.
    Custom(Arc<dyn Fn(&ParameterDict) -> DriverResult<Vec<u8>> + Send + Sync>),
}

/// What acknowledges a command.
#[derive(Debug, Clone)]
pub enum Expect {
    /// Wait for this byte sequence in the response stream.
    Prompt(Bytes),
    /// Wait for the first of several byte sequences.
    AnyPrompt(Vec<Bytes>),
    /// Fire and forget.
    Nothing,
}

/// A named wire command with its acknowledgement rules.
#[derive(Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    payload: Payload,
    expect: Expect,
    error_prompt: Option<Bytes>,
    timeout: Option<Duration>,
    claims: Option<&'static str>,
    wakeup: bool,
}

impl CommandSpec {
    pub fn new(name: &'static str, payload: Payload) -> Self {
        Self {
            name,
            payload,
            expect: Expect::Nothing,
            error_prompt: None,
            timeout: None,
            claims: None,
            wakeup: false,
        }
    }

    pub fn literal(name: &'static str, bytes: &'static [u8]) -> Self {
        Self::new(name, Payload::Literal(Bytes::from_static(bytes)))
    }

    pub fn expect_prompt(mut self, prompt: &'static [u8]) -> Self {
        self.expect = Expect::Prompt(Bytes::from_static(prompt));
        self
    }

    pub fn expect_any(mut self, prompts: Vec<Bytes>) -> Self {
        self.expect = Expect::AnyPrompt(prompts);
        self
    }

    /// Fail fast when this sequence shows up instead of the prompt.
    pub fn with_error_prompt(mut self, prompt: &'static [u8]) -> Self {
        self.error_prompt = Some(Bytes::from_static(prompt));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Claim the next chunk with this label so the response frame is
    /// not republished as a sample.
    pub fn claims(mut self, label: &'static str) -> Self {
        self.claims = Some(label);
        self
    }

    pub fn with_wakeup(mut self, wakeup: bool) -> Self {
        self.wakeup = wakeup;
        self
    }
}

/// Parses the raw response (everything up to and including the prompt)
/// into the command's result value.
pub type ResponseFn = Arc<dyn Fn(&mut ParameterDict, &[u8]) -> DriverResult<Value> + Send + Sync>;

/// Housekeeping event fired on a parameter-controlled interval. The
/// parameter holds an `HH:MM:SS` string; `00:00:00` disables the job.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledJob {
    pub name: &'static str,
    pub event: ProtocolEvent,
    pub interval_param: &'static str,
}

//============================================================
// Canned response handlers
//============================================================

/// Response handler that locates a config frame in the response,
/// verifies it and folds its fields into the dict. A frame with a bad
/// checksum is reported but not applied.
pub fn config_update_response(spec: FrameSpec) -> ResponseFn {
    Arc::new(move |params, raw| {
        let at = codec::find_sub(raw, spec.sync).ok_or_else(|| {
            InstrumentError::Protocol(format!("no {} frame in response", spec.label))
        })?;
        let frame = raw.get(at..at + spec.length).ok_or_else(|| {
            InstrumentError::Protocol(format!("truncated {} frame in response", spec.label))
        })?;
        if !spec.checksum_ok(frame) {
            warn!(stream = spec.label, "config frame failed checksum, not applied");
            return Ok(json!({ "applied": false, "checksum_ok": false }));
        }
        let report = params.update(frame, UpdateTarget::Current)?;
        Ok(json!({ "applied": true, "checksum_ok": true, "changed": report.changed }))
    })
}

/// Response handler for a BCD clock readback: decodes the leading six
/// bytes into an RFC 3339 timestamp.
pub fn clock_read_response() -> ResponseFn {
    Arc::new(|_params, raw| {
        let when = codec::decode_clock(raw)?;
        Ok(Value::String(when.to_rfc3339()))
    })
}

/// Response handler returning the printable portion of the response.
pub fn ascii_response() -> ResponseFn {
    Arc::new(|_params, raw| {
        let text: String = raw
            .iter()
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|b| *b as char)
            .collect();
        Ok(Value::String(text.trim().to_owned()))
    })
}

//============================================================
// Builder
//============================================================

struct ProtocolConfig {
    break_sequence: Vec<(Bytes, Duration)>,
    wakeup: Option<Bytes>,
    command_prompt: Option<Bytes>,
    confirm_prompt: Option<Bytes>,
    confirm_command: Option<&'static str>,
    commands: HashMap<&'static str, CommandSpec>,
    responses: HashMap<(Option<ProtocolState>, &'static str), ResponseFn>,
    chunk_matchers: Vec<ChunkMatcher>,
    templates: Vec<SampleTemplate>,
    dedup: bool,
    params: ParameterDict,
    user_frame: Option<FrameSpec>,
    write_config_command: Option<&'static str>,
    read_config_command: Option<&'static str>,
    set_clock_command: Option<&'static str>,
    read_clock_command: Option<&'static str>,
    status_commands: Vec<&'static str>,
    sample_command: Option<&'static str>,
    start_autosample_command: Option<&'static str>,
    stop_autosample_command: Option<&'static str>,
    stop_via_break: bool,
    scheduled_jobs: Vec<ScheduledJob>,
}

type ProtoHandler = Handler<ProtocolCtx, ProtocolState, EventArgs>;

/// Describes one instrument family to the protocol engine.
pub struct ProtocolBuilder {
    config: ProtocolConfig,
    extra: Vec<(ProtocolState, ProtocolEvent, ProtoHandler)>,
}

impl Default for ProtocolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolBuilder {
    pub fn new() -> Self {
        Self {
            config: ProtocolConfig {
                break_sequence: Vec::new(),
                wakeup: None,
                command_prompt: None,
                confirm_prompt: None,
                confirm_command: None,
                commands: HashMap::new(),
                responses: HashMap::new(),
                chunk_matchers: Vec::new(),
                templates: Vec::new(),
                dedup: false,
                params: ParameterDict::new(),
                user_frame: None,
                write_config_command: None,
                read_config_command: None,
                set_clock_command: None,
                read_clock_command: None,
                status_commands: Vec::new(),
                sample_command: None,
                start_autosample_command: None,
                stop_autosample_command: None,
                stop_via_break: false,
                scheduled_jobs: Vec::new(),
            },
            extra: Vec::new(),
        }
    }

    /// Steps sent to knock the instrument into command mode: bytes,
    /// then a pause, per step.
    pub fn with_break_sequence(mut self, steps: Vec<(Bytes, Duration)>) -> Self {
        self.config.break_sequence = steps;
        self
    }

    pub fn with_wakeup(mut self, bytes: &'static [u8]) -> Self {
        self.config.wakeup = Some(Bytes::from_static(bytes));
        self
    }

    /// The prompt that proves the instrument sits in command mode.
    pub fn with_command_prompt(mut self, prompt: &'static [u8]) -> Self {
        self.config.command_prompt = Some(Bytes::from_static(prompt));
        self
    }

    /// A confirmation prompt and the named command that answers it.
    pub fn with_confirm(mut self, prompt: &'static [u8], command: &'static str) -> Self {
        self.config.confirm_prompt = Some(Bytes::from_static(prompt));
        self.config.confirm_command = Some(command);
        self
    }

    pub fn command(mut self, spec: CommandSpec) -> Self {
        if self.config.commands.insert(spec.name, spec).is_some() {
            debug!("command overwritten in builder");
        }
        self
    }

    /// Response handler for a command in any state.
    pub fn response(mut self, command: &'static str, handler: ResponseFn) -> Self {
        self.config.responses.insert((None, command), handler);
        self
    }

    /// Response handler used only when the command ran in `state`;
    /// beats the any-state handler.
    pub fn state_response(
        mut self,
        state: ProtocolState,
        command: &'static str,
        handler: ResponseFn,
    ) -> Self {
        self.config.responses.insert((Some(state), command), handler);
        self
    }

    pub fn with_chunk_matcher(mut self, matcher: ChunkMatcher) -> Self {
        self.config.chunk_matchers.push(matcher);
        self
    }

    pub fn with_template(mut self, template: SampleTemplate) -> Self {
        self.config.templates.push(template);
        self
    }

    /// Suppress consecutive identical sample frames.
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.config.dedup = dedup;
        self
    }

    pub fn with_params(mut self, params: ParameterDict) -> Self {
        self.config.params = params;
        self
    }

    /// Layout of the writable config frame, used by
    /// [`Payload::ConfigFrame`] commands.
    pub fn with_user_frame(mut self, spec: FrameSpec) -> Self {
        self.config.user_frame = Some(spec);
        self
    }

    /// Command that writes the config frame after a successful set.
    pub fn with_write_config(mut self, command: &'static str) -> Self {
        self.config.write_config_command = Some(command);
        self
    }

    pub fn with_read_config(mut self, command: &'static str) -> Self {
        self.config.read_config_command = Some(command);
        self
    }

    pub fn with_clock_commands(mut self, set: &'static str, read: Option<&'static str>) -> Self {
        self.config.set_clock_command = Some(set);
        self.config.read_clock_command = read;
        self
    }

    pub fn with_status_commands(mut self, commands: Vec<&'static str>) -> Self {
        self.config.status_commands = commands;
        self
    }

    pub fn with_sample_command(mut self, command: &'static str) -> Self {
        self.config.sample_command = Some(command);
        self
    }

    pub fn with_start_autosample(mut self, command: &'static str) -> Self {
        self.config.start_autosample_command = Some(command);
        self
    }

    pub fn with_stop_autosample_command(mut self, command: &'static str) -> Self {
        self.config.stop_autosample_command = Some(command);
        self
    }

    /// Stop autosample with the break sequence instead of a command.
    pub fn stop_autosample_via_break(mut self, via_break: bool) -> Self {
        self.config.stop_via_break = via_break;
        self
    }

    pub fn scheduled_job(
        mut self,
        name: &'static str,
        event: ProtocolEvent,
        interval_param: &'static str,
    ) -> Self {
        self.config.scheduled_jobs.push(ScheduledJob {
            name,
            event,
            interval_param,
        });
        self
    }

    /// Register or override a machine handler. Later registrations win,
    /// including over the engine's standard table.
    pub fn handler(
        mut self,
        state: ProtocolState,
        event: ProtocolEvent,
        handler: ProtoHandler,
    ) -> Self {
        self.extra.push((state, event, handler));
        self
    }

    fn validate(&self) -> DriverResult<()> {
        let config = &self.config;
        let need = |cmd: Option<&'static str>, what: &str| -> DriverResult<()> {
            if let Some(name) = cmd {
                if !config.commands.contains_key(name) {
                    return Err(InstrumentError::Configuration(format!(
                        "{what} references unknown command '{name}'"
                    )));
                }
            }
            Ok(())
        };
        need(config.write_config_command, "write-config")?;
        need(config.read_config_command, "read-config")?;
        need(config.set_clock_command, "clock set")?;
        need(config.read_clock_command, "clock read")?;
        need(config.sample_command, "acquire-sample")?;
        need(config.start_autosample_command, "autosample start")?;
        need(config.stop_autosample_command, "autosample stop")?;
        need(config.confirm_command, "confirm")?;
        for cmd in &config.status_commands {
            need(Some(cmd), "status sweep")?;
        }
        for job in &config.scheduled_jobs {
            if config.params.get(job.interval_param).is_err() {
                return Err(InstrumentError::Configuration(format!(
                    "scheduled job '{}' references unknown parameter '{}'",
                    job.name, job.interval_param
                )));
            }
        }
        let needs_frame = config
            .commands
            .values()
            .any(|c| matches!(c.payload, Payload::ConfigFrame { .. }));
        if needs_frame && config.user_frame.is_none() {
            return Err(InstrumentError::Configuration(
                "a command renders the config frame but no frame layout is declared".into(),
            ));
        }
        Ok(())
    }
}

//============================================================
// Shared session state
//============================================================

struct Shared {
    response: Mutex<BytesMut>,
    response_cap: usize,
    chunker: Mutex<Chunker>,
    router: Mutex<SampleRouter>,
    da_active: AtomicBool,
    da_echo: Mutex<VecDeque<Bytes>>,
    chunks_seen: AtomicU64,
    notifier: NotificationSender,
}

const DA_ECHO_DEPTH: usize = 32;

//============================================================
// Machine context
//============================================================

/// Domain state the protocol machine's handlers operate on. Custom
/// handlers registered through [`ProtocolBuilder::handler`] receive
/// this as their context.
pub struct ProtocolCtx {
    config: ProtocolConfig,
    settings: ProtocolSettings,
    shared: Arc<Shared>,
    writer: SharedConnection,
    scheduler: Scheduler,
    event_tx: mpsc::UnboundedSender<ProtocolEvent>,
    startup_applied: bool,
    current: Option<ProtocolState>,
}

impl ProtocolCtx {
    pub fn params(&self) -> &ParameterDict {
        &self.config.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterDict {
        &mut self.config.params
    }

    /// Record the new state and broadcast it. Runs inside the machine
    /// mutex, so observers see state changes in transition order.
    pub fn announce(&mut self, state: ProtocolState) {
        self.current = Some(state);
        let _ = self
            .shared
            .notifier
            .send(Notification::new(NotificationKind::StateChange, json!(state)));
    }

    async fn send_bytes(&self, data: &[u8]) -> DriverResult<()> {
        let mut conn = self.writer.lock().await;
        conn.send(data).await
    }

    /// Nudge a sleeping instrument until any known prompt comes back,
    /// repeating the nudge at the wakeup delay. Bounded by `timeout`;
    /// a no-op for protocols without a wakeup sequence.
    async fn wakeup(&self, timeout: Duration) -> DriverResult<()> {
        let Some(wakeup) = self.config.wakeup.clone() else {
            return Ok(());
        };
        let prompts: Vec<Bytes> = [
            self.config.command_prompt.clone(),
            self.config.confirm_prompt.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();

        self.shared.response.lock().clear();
        let deadline = Instant::now() + timeout;
        loop {
            self.send_bytes(&wakeup).await?;
            sleep(self.settings.wakeup_delay).await;
            if prompts.is_empty() {
                // Nothing to wait for; one nudge is the best we can do.
                return Ok(());
            }
            {
                let buf = self.shared.response.lock();
                if prompts.iter().any(|p| codec::find_sub(&buf, p).is_some()) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(InstrumentError::timeout(timeout, "wakeup prompt"));
            }
        }
    }

    fn render_payload(&self, spec: &CommandSpec) -> DriverResult<Vec<u8>> {
        match &spec.payload {
            Payload::Literal(bytes) => Ok(bytes.to_vec()),
            Payload::ConfigFrame { prefix } => {
                let frame_spec = self.config.user_frame.ok_or_else(|| {
                    InstrumentError::Configuration("no config frame layout declared".into())
                })?;
                let mut out = prefix.to_vec();
                out.extend(self.config.params.build_frame(&frame_spec)?);
                Ok(out)
            }
            Payload::Custom(build) => build(&self.config.params),
        }
    }

    /// Send a named command and wait for its acknowledgement, polling
    /// the response buffer at the configured interval. The raw response
    /// (through the prompt) goes to the command's response handler; a
    /// handler registered for the current state beats the any-state
    /// one.
    pub async fn do_cmd_resp(&mut self, name: &str) -> DriverResult<Value> {
        let spec = self
            .config
            .commands
            .get(name)
            .cloned()
            .ok_or_else(|| {
                InstrumentError::Configuration(format!("no command named '{name}'"))
            })?;

        let timeout = spec.timeout.unwrap_or(self.settings.default_timeout);
        if spec.wakeup {
            self.wakeup(timeout).await?;
        }
        if let Some(label) = spec.claims {
            self.shared.chunker.lock().claim_next(label);
        }
        self.shared.response.lock().clear();

        let payload = self.render_payload(&spec)?;
        debug!(command = spec.name, bytes = payload.len(), "sending command");
        self.send_bytes(&payload).await?;

        let raw = match &spec.expect {
            Expect::Nothing => Bytes::new(),
            Expect::Prompt(prompt) => {
                self.await_prompt(
                    std::slice::from_ref(prompt),
                    spec.error_prompt.as_ref(),
                    timeout,
                    spec.name,
                )
                .await?
            }
            Expect::AnyPrompt(prompts) => {
                self.await_prompt(prompts, spec.error_prompt.as_ref(), timeout, spec.name)
                    .await?
            }
        };

        let handler = self
            .config
            .responses
            .get(&(self.current, spec.name))
            .or_else(|| self.config.responses.get(&(None, spec.name)))
            .cloned();
        match handler {
            Some(handler) => handler(&mut self.config.params, &raw),
            None => Ok(Value::Null),
        }
    }

    /// Poll the response buffer until a prompt shows up. Total wait is
    /// bounded by `timeout` plus at most one poll interval.
    async fn await_prompt(
        &self,
        prompts: &[Bytes],
        error_prompt: Option<&Bytes>,
        timeout: Duration,
        what: &str,
    ) -> DriverResult<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let buf = self.shared.response.lock();
                if let Some(bad) = error_prompt {
                    if codec::find_sub(&buf, bad).is_some() {
                        return Err(InstrumentError::Protocol(format!(
                            "instrument rejected '{what}'"
                        )));
                    }
                }
                for prompt in prompts {
                    if let Some(at) = codec::find_sub(&buf, prompt) {
                        return Ok(Bytes::copy_from_slice(&buf[..at + prompt.len()]));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(InstrumentError::timeout(
                    timeout,
                    format!("response to '{what}'"),
                ));
            }
            sleep(self.settings.response_poll_interval).await;
        }
    }

    fn emit_result(&self, op: &str, value: Value) {
        let _ = self.shared.notifier.send(Notification::new(
            NotificationKind::Result,
            json!({ "op": op, "value": value }),
        ));
    }

    fn emit_config_change(&self) {
        let _ = self.shared.notifier.send(Notification::new(
            NotificationKind::ConfigChange,
            self.config.params.get_config(),
        ));
    }

    //--------------------------------------------------------
    // Standard handlers
    //--------------------------------------------------------

    async fn on_discover(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        let baseline = self.shared.chunks_seen.load(Ordering::Relaxed);
        for attempt in 1..=self.settings.discovery_attempts {
            debug!(attempt, "probing for instrument mode");
            self.shared.response.lock().clear();
            for (bytes, pause) in &self.config.break_sequence {
                self.send_bytes(bytes).await?;
                sleep(*pause).await;
            }

            let deadline = Instant::now() + self.settings.discovery_delay;
            loop {
                let (saw_command, saw_confirm) = {
                    let buf = self.shared.response.lock();
                    let command = self
                        .config
                        .command_prompt
                        .as_ref()
                        .is_some_and(|p| codec::find_sub(&buf, p).is_some());
                    let confirm = self
                        .config
                        .confirm_prompt
                        .as_ref()
                        .is_some_and(|p| codec::find_sub(&buf, p).is_some());
                    (command, confirm)
                };
                if saw_command {
                    return Ok(Handled::transition_with(
                        ProtocolState::Command,
                        json!(ProtocolState::Command),
                    ));
                }
                if saw_confirm {
                    if let Some(confirm) = self.config.confirm_command {
                        self.do_cmd_resp(confirm).await?;
                        return Ok(Handled::transition_with(
                            ProtocolState::Command,
                            json!(ProtocolState::Command),
                        ));
                    }
                }
                if self.shared.chunks_seen.load(Ordering::Relaxed) > baseline {
                    return Ok(Handled::transition_with(
                        ProtocolState::Autosample,
                        json!(ProtocolState::Autosample),
                    ));
                }
                if Instant::now() >= deadline {
                    break;
                }
                sleep(self.settings.response_poll_interval).await;
            }
            warn!(attempt, "no recognizable response from instrument");
        }
        Err(InstrumentError::Protocol(format!(
            "instrument did not respond after {} discovery attempts",
            self.settings.discovery_attempts
        )))
    }

    /// Skip discovery and jump straight to a known state. Test and
    /// recovery tooling only; nothing is sent to the instrument and no
    /// entry work runs.
    async fn on_force_state(&mut self, args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        let EventArgs::State(target) = args else {
            return Err(InstrumentError::Parameter(
                "force requires a target state".into(),
            ));
        };
        warn!(?target, "forcing protocol state");
        self.announce(target);
        Ok(Handled::jump_with(target, json!(target)))
    }

    async fn on_enter_command(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        self.announce(ProtocolState::Command);
        self.refresh_params().await?;
        self.apply_startup().await?;
        self.start_jobs()?;
        Ok(Handled::stay())
    }

    async fn on_exit_command(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        self.stop_jobs();
        Ok(Handled::stay())
    }

    async fn on_enter_autosample(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        self.announce(ProtocolState::Autosample);
        self.start_jobs()?;
        Ok(Handled::stay())
    }

    async fn on_exit_autosample(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        self.stop_jobs();
        Ok(Handled::stay())
    }

    async fn on_enter_direct(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        self.announce(ProtocolState::DirectAccess);
        self.shared.da_echo.lock().clear();
        self.shared.da_active.store(true, Ordering::SeqCst);
        Ok(Handled::stay())
    }

    async fn on_exit_direct(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        self.shared.da_active.store(false, Ordering::SeqCst);
        Ok(Handled::stay())
    }

    /// Pull the live configuration into the dict. Runs on command-mode
    /// entry, before startup values are applied.
    async fn refresh_params(&mut self) -> DriverResult<()> {
        if let Some(cmd) = self.config.read_config_command {
            self.do_cmd_resp(cmd).await?;
        }
        Ok(())
    }

    async fn apply_startup(&mut self) -> DriverResult<()> {
        if self.startup_applied {
            return Ok(());
        }
        self.startup_applied = true;
        let staged = self.config.params.startup_values();
        let mut dirty = false;
        for (name, value) in staged {
            if self.config.params.set_from_value(&name, value)? {
                dirty = true;
            }
        }
        if dirty {
            debug!("applying staged startup parameters");
            self.write_config().await?;
        }
        Ok(())
    }

    async fn write_config(&mut self) -> DriverResult<()> {
        if let Some(cmd) = self.config.write_config_command {
            self.do_cmd_resp(cmd).await?;
        }
        self.emit_config_change();
        Ok(())
    }

    fn start_jobs(&mut self) -> DriverResult<()> {
        for job in self.config.scheduled_jobs.clone() {
            let value = self.config.params.get(job.interval_param)?.current_value();
            let Some(ParamValue::Str(text)) = value else {
                debug!(job = job.name, "no interval configured, job not started");
                continue;
            };
            let interval = codec::parse_interval(text)?;
            if interval.is_zero() {
                debug!(job = job.name, "interval 00:00:00, job disabled");
                continue;
            }
            let tx = self.event_tx.clone();
            let event = job.event;
            self.scheduler.add_job(
                job.name,
                Trigger::Interval {
                    weeks: 0,
                    days: 0,
                    hours: 0,
                    minutes: 0,
                    seconds: interval.as_secs(),
                },
                Arc::new(move || {
                    let _ = tx.send(event);
                }),
            )?;
        }
        Ok(())
    }

    fn stop_jobs(&self) {
        for job in &self.config.scheduled_jobs {
            self.scheduler.remove_job(job.name);
        }
    }

    async fn on_get(&mut self, args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        let names = match args {
            EventArgs::None => Vec::new(),
            EventArgs::Names(names) => names,
            other => {
                return Err(InstrumentError::Protocol(format!(
                    "get does not understand {other:?}"
                )))
            }
        };
        let value = if names.is_empty() {
            self.config.params.get_config()
        } else {
            let mut map = serde_json::Map::new();
            for name in names {
                let parameter = self.config.params.get(&name)?;
                let value = parameter.current_value().ok_or_else(|| {
                    InstrumentError::Parameter(format!("'{name}' has no value yet"))
                })?;
                map.insert(name, value.as_json());
            }
            Value::Object(map)
        };
        Ok(Handled::with_result(value))
    }

    async fn on_set(&mut self, args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        let EventArgs::Settings(settings) = args else {
            return Err(InstrumentError::Protocol("set needs parameter values".into()));
        };
        if settings.is_empty() {
            return Err(InstrumentError::Parameter("set with no values".into()));
        }

        // Validate everything before touching anything.
        let mut staged = Vec::with_capacity(settings.len());
        for (name, value) in &settings {
            let parameter = self.config.params.get(name)?;
            match parameter.visibility() {
                Visibility::ReadOnly => {
                    return Err(InstrumentError::ParameterReadOnly(name.clone()))
                }
                Visibility::Immutable if self.startup_applied => {
                    return Err(InstrumentError::Parameter(format!(
                        "'{name}' cannot change after startup"
                    )))
                }
                Visibility::DirectAccess => {
                    return Err(InstrumentError::Parameter(format!(
                        "'{name}' is only writable over direct access"
                    )))
                }
                _ => {}
            }
            staged.push((
                name.clone(),
                ParamValue::coerce(name, parameter.param_type(), value)?,
            ));
        }

        let mut changed = Vec::new();
        for (name, value) in staged {
            if self.config.params.set_from_value(&name, value)? {
                changed.push(name);
            }
        }
        if !changed.is_empty() {
            self.write_config().await?;
        }
        Ok(Handled::with_result(json!({ "changed": changed })))
    }

    async fn on_execute(&mut self, args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        let EventArgs::Command(name) = args else {
            return Err(InstrumentError::Protocol("execute needs a command name".into()));
        };
        let value = self.do_cmd_resp(&name).await?;
        Ok(Handled::with_result(value))
    }

    async fn on_acquire_sample(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        let cmd = self.config.sample_command.ok_or_else(|| {
            InstrumentError::Configuration("no acquire-sample command configured".into())
        })?;
        let value = self.do_cmd_resp(cmd).await?;
        Ok(Handled::with_result(value))
    }

    async fn acquire_status_inner(&mut self) -> DriverResult<Value> {
        if self.config.status_commands.is_empty() {
            return Err(InstrumentError::Configuration(
                "no status commands configured".into(),
            ));
        }
        let mut out = serde_json::Map::new();
        for cmd in self.config.status_commands.clone() {
            let value = self.do_cmd_resp(cmd).await?;
            out.insert(cmd.to_owned(), value);
        }
        Ok(Value::Object(out))
    }

    async fn on_acquire_status(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        let value = self.acquire_status_inner().await?;
        Ok(Handled::with_result(value))
    }

    async fn on_scheduled_acquire_status(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        let value = self.acquire_status_inner().await?;
        self.emit_result("acquire_status", value);
        Ok(Handled::stay())
    }

    async fn clock_sync_inner(&mut self) -> DriverResult<Value> {
        let set_cmd = self.config.set_clock_command.ok_or_else(|| {
            InstrumentError::Configuration("no clock-sync command configured".into())
        })?;
        self.do_cmd_resp(set_cmd).await?;
        if let Some(read_cmd) = self.config.read_clock_command {
            let reported = self.do_cmd_resp(read_cmd).await?;
            Ok(json!({ "synced": true, "instrument_time": reported }))
        } else {
            Ok(json!({ "synced": true }))
        }
    }

    async fn on_clock_sync(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        let value = self.clock_sync_inner().await?;
        Ok(Handled::with_result(value))
    }

    async fn on_scheduled_clock_sync(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        let value = self.clock_sync_inner().await?;
        self.emit_result("clock_sync", value);
        Ok(Handled::stay())
    }

    async fn on_start_autosample(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        let cmd = self.config.start_autosample_command.ok_or_else(|| {
            InstrumentError::Configuration("no autosample start command configured".into())
        })?;
        self.do_cmd_resp(cmd).await?;
        Ok(Handled::transition(ProtocolState::Autosample))
    }

    async fn on_stop_autosample(
        &mut self,
        _args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        if self.config.stop_via_break {
            self.break_to_command().await?;
        } else {
            let cmd = self.config.stop_autosample_command.ok_or_else(|| {
                InstrumentError::Configuration("no autosample stop command configured".into())
            })?;
            self.do_cmd_resp(cmd).await?;
        }
        Ok(Handled::transition(ProtocolState::Command))
    }

    /// Send the break sequence and ride the confirm handshake back to
    /// the command prompt.
    async fn break_to_command(&mut self) -> DriverResult<()> {
        self.shared.response.lock().clear();
        for (bytes, pause) in &self.config.break_sequence {
            self.send_bytes(bytes).await?;
            sleep(*pause).await;
        }
        let timeout = self.settings.default_timeout;
        if let (Some(confirm_prompt), Some(confirm_cmd)) = (
            self.config.confirm_prompt.clone(),
            self.config.confirm_command,
        ) {
            self.await_prompt(
                std::slice::from_ref(&confirm_prompt),
                None,
                timeout,
                "break confirmation",
            )
            .await?;
            self.do_cmd_resp(confirm_cmd).await?;
        } else if let Some(prompt) = self.config.command_prompt.clone() {
            self.await_prompt(std::slice::from_ref(&prompt), None, timeout, "command prompt")
                .await?;
        }
        Ok(())
    }

    async fn on_start_direct(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        Ok(Handled::transition(ProtocolState::DirectAccess))
    }

    async fn on_stop_direct(&mut self, _args: EventArgs) -> DriverResult<Handled<ProtocolState>> {
        Ok(Handled::transition(ProtocolState::Command))
    }

    async fn on_execute_direct(
        &mut self,
        args: EventArgs,
    ) -> DriverResult<Handled<ProtocolState>> {
        let EventArgs::Raw(bytes) = args else {
            return Err(InstrumentError::Protocol(
                "direct execute needs raw bytes".into(),
            ));
        };
        {
            let mut echoes = self.shared.da_echo.lock();
            if echoes.len() == DA_ECHO_DEPTH {
                echoes.pop_front();
            }
            echoes.push_back(bytes.clone());
        }
        self.send_bytes(&bytes).await?;
        Ok(Handled::stay())
    }
}

//============================================================
// Machine assembly
//============================================================

/// Wires one `ProtocolCtx` method into the transition table.
macro_rules! route {
    ($builder:expr, $state:expr, $event:expr, $method:ident) => {
        $builder.handler(
            $state,
            $event,
            Box::new(|c, a| Box::pin(ProtocolCtx::$method(c, a))),
        )
    };
}

fn build_machine(
    extra: Vec<(ProtocolState, ProtocolEvent, ProtoHandler)>,
) -> StateMachine<ProtocolCtx, ProtocolState, ProtocolEvent, EventArgs> {
    use ProtocolEvent as E;
    use ProtocolState as S;

    let mut builder = MachineBuilder::new();
    builder = route!(builder, S::Unknown, E::Discover, on_discover);
    builder = route!(builder, S::Unknown, E::ForceState, on_force_state);

    builder = route!(builder, S::Command, E::Enter, on_enter_command);
    builder = route!(builder, S::Command, E::Exit, on_exit_command);
    builder = route!(builder, S::Command, E::Get, on_get);
    builder = route!(builder, S::Command, E::Set, on_set);
    builder = route!(builder, S::Command, E::Execute, on_execute);
    builder = route!(builder, S::Command, E::AcquireSample, on_acquire_sample);
    builder = route!(builder, S::Command, E::AcquireStatus, on_acquire_status);
    builder = route!(builder, S::Command, E::ClockSync, on_clock_sync);
    builder = route!(builder, S::Command, E::ScheduledClockSync, on_scheduled_clock_sync);
    builder = route!(
        builder,
        S::Command,
        E::ScheduledAcquireStatus,
        on_scheduled_acquire_status
    );
    builder = route!(builder, S::Command, E::StartAutosample, on_start_autosample);
    builder = route!(builder, S::Command, E::StartDirect, on_start_direct);

    builder = route!(builder, S::Autosample, E::Enter, on_enter_autosample);
    builder = route!(builder, S::Autosample, E::Exit, on_exit_autosample);
    builder = route!(builder, S::Autosample, E::Get, on_get);
    builder = route!(builder, S::Autosample, E::StopAutosample, on_stop_autosample);
    builder = route!(builder, S::Autosample, E::ScheduledClockSync, on_scheduled_clock_sync);
    builder = route!(
        builder,
        S::Autosample,
        E::ScheduledAcquireStatus,
        on_scheduled_acquire_status
    );

    builder = route!(builder, S::DirectAccess, E::Enter, on_enter_direct);
    builder = route!(builder, S::DirectAccess, E::Exit, on_exit_direct);
    builder = route!(builder, S::DirectAccess, E::ExecuteDirect, on_execute_direct);
    builder = route!(builder, S::DirectAccess, E::StopDirect, on_stop_direct);

    for (state, event, handler) in extra {
        builder = builder.handler(state, event, handler);
    }
    builder.build()
}

//============================================================
// The protocol session
//============================================================

/// A running protocol session: the machine plus its pump tasks.
pub struct Protocol {
    pub(crate) fsm: SharedMachine<ProtocolCtx, ProtocolState, ProtocolEvent, EventArgs>,
    tasks: Vec<JoinHandle<()>>,
    scheduler: Scheduler,
}

impl Protocol {
    /// Build and start a session over an open transport. The machine
    /// starts in [`ProtocolState::Unknown`]; dispatch
    /// [`ProtocolEvent::Discover`] to find the instrument.
    pub async fn start(
        builder: ProtocolBuilder,
        settings: ProtocolSettings,
        writer: SharedConnection,
        data: DataStream,
        lost: mpsc::UnboundedSender<()>,
        notifier: NotificationSender,
    ) -> DriverResult<Protocol> {
        settings.validate()?;
        builder.validate()?;
        let ProtocolBuilder { config, extra } = builder;

        let shared = Arc::new(Shared {
            response: Mutex::new(BytesMut::new()),
            response_cap: settings.max_frame_buffer,
            chunker: Mutex::new(
                Chunker::new(config.chunk_matchers.clone())
                    .with_max_buffer(settings.max_frame_buffer),
            ),
            router: Mutex::new(
                SampleRouter::new(config.templates.clone(), notifier.clone())
                    .with_dedup(config.dedup),
            ),
            da_active: AtomicBool::new(false),
            da_echo: Mutex::new(VecDeque::new()),
            chunks_seen: AtomicU64::new(0),
            notifier: notifier.clone(),
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new();
        let ctx = ProtocolCtx {
            config,
            settings,
            shared: Arc::clone(&shared),
            writer,
            scheduler: scheduler.clone(),
            event_tx,
            startup_applied: false,
            current: None,
        };

        let fsm = SharedMachine::new(build_machine(extra), ctx);
        fsm.start(ProtocolState::Unknown).await;

        let pump = spawn_data_pump(shared, data, lost);
        let events = spawn_event_pump(fsm.clone(), event_rx, notifier);
        Ok(Protocol {
            fsm,
            tasks: vec![pump, events],
            scheduler,
        })
    }

    /// Serialized event dispatch; see [`SharedMachine::on_event`].
    pub async fn dispatch(&self, event: ProtocolEvent, args: EventArgs) -> DriverResult<Value> {
        self.fsm.on_event(event, args).await
    }

    pub async fn state(&self) -> Option<ProtocolState> {
        self.fsm.state().await
    }

    /// Events legal in the current state, sorted for stable output.
    pub async fn capabilities(&self) -> Vec<ProtocolEvent> {
        let Some(state) = self.fsm.state().await else {
            return Vec::new();
        };
        let mut events = self.fsm.events_in(state).await;
        events.sort();
        events
    }

    /// Stop pump tasks and scheduled jobs. The transport stays with the
    /// driver for reconnection.
    pub async fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.scheduler.clear();
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

//============================================================
// Pumps
//============================================================

fn spawn_data_pump(
    shared: Arc<Shared>,
    mut data: DataStream,
    lost: mpsc::UnboundedSender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = data.recv().await {
            {
                let mut buf = shared.response.lock();
                buf.extend_from_slice(&bytes);
                if buf.len() > shared.response_cap {
                    let overflow = buf.len() - shared.response_cap;
                    let _ = buf.split_to(overflow);
                }
            }

            if shared.da_active.load(Ordering::SeqCst) {
                forward_direct(&shared, bytes);
                continue;
            }

            let chunks = {
                let mut chunker = shared.chunker.lock();
                chunker.push(&bytes);
                let mut out = Vec::new();
                while let Some(chunk) = chunker.next_chunk() {
                    out.push(chunk);
                }
                out
            };
            for chunk in chunks {
                shared.chunks_seen.fetch_add(1, Ordering::Relaxed);
                let routed = shared.router.lock().route(&chunk);
                if let Err(e) = routed {
                    warn!(stream = chunk.label, error = %e, "failed to route sample");
                    let _ = shared.notifier.send(Notification::new(
                        NotificationKind::Error,
                        json!({ "stream": chunk.label, "error": e.to_string() }),
                    ));
                }
            }
        }
        debug!("transport closed its read stream");
        let _ = lost.send(());
    })
}

/// Pass instrument output to direct-access observers, minus the echo
/// of what the session itself just sent. An echo split across reads is
/// trimmed piecewise; the remainder stays queued for the next read.
fn forward_direct(shared: &Shared, bytes: Bytes) {
    let mut payload = bytes;
    {
        let mut echoes = shared.da_echo.lock();
        while !payload.is_empty() {
            let Some(front) = echoes.front_mut() else {
                break;
            };
            if payload.starts_with(front) {
                payload = payload.slice(front.len()..);
                echoes.pop_front();
            } else if front.starts_with(&payload) {
                *front = front.slice(payload.len()..);
                payload = Bytes::new();
            } else {
                break;
            }
        }
    }
    if payload.is_empty() {
        return;
    }
    let _ = shared.notifier.send(Notification::new(
        NotificationKind::DirectAccess,
        json!({ "data": String::from_utf8_lossy(&payload) }),
    ));
}

fn spawn_event_pump(
    fsm: SharedMachine<ProtocolCtx, ProtocolState, ProtocolEvent, EventArgs>,
    mut events: mpsc::UnboundedReceiver<ProtocolEvent>,
    notifier: NotificationSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = fsm.on_event(event, EventArgs::None).await {
                warn!(?event, error = %e, "scheduled event failed");
                let _ = notifier.send(Notification::new(
                    NotificationKind::Error,
                    json!({ "event": format!("{event:?}"), "error": e.to_string() }),
                ));
            }
        }
    })
}
