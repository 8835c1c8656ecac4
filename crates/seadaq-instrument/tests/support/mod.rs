//! An in-process acoustic profiler for driver tests.
//!
//! Speaks a Nortek-flavored wire protocol: `@@@@@@` + `K1W%!Q` break
//! with a `Confirm:`/`MC` handshake, two-letter commands acked with
//! `\x06\x06`, a 512-byte binary user configuration frame, a BCD
//! clock, and 24-byte profile frames streamed in autosample mode.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};

use seadaq_core::{DriverResult, Notification, NotificationKind, NotificationReceiver};
use seadaq_instrument::codec;
use seadaq_instrument::params::{FormatFn, ParseFn};
use seadaq_instrument::{
    ascii_response, clock_read_response, config_update_response, format_le_u16,
    format_padded_ascii, parse_le_u16, ChunkMatcher, CommandSpec, Connection, DataSink, FieldSpec,
    FrameSpec, InstrumentDriver, Matcher, ParamType, ParamValue, Parameter, ParameterDict,
    Payload, ProtocolBuilder, ProtocolEvent, ProtocolFactory, ProtocolSettings, ResponseFn,
    SampleTemplate, Visibility,
};

pub const ACK: &[u8] = b"\x06\x06";
pub const NACK: &[u8] = b"\x15\x15";

pub const USER_CONFIG: FrameSpec = FrameSpec::new("user_config", &[0xA5, 0x00, 0x00, 0x01], 512);
pub const PROFILE: FrameSpec = FrameSpec::new("profile", &[0xA5, 0x01, 0x0C, 0x00], 24);

//============================================================
// The simulated instrument
//============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    Command,
    /// Break received in autosample; waiting for `MC`.
    Confirm,
    Autosample,
}

pub struct MockState {
    pub mode: Mutex<MockMode>,
    /// Ignore every byte written to the instrument.
    pub silent: AtomicBool,
    /// Writes to swallow before the instrument answers anything again;
    /// the write that empties this rouses it with the command prompt.
    pub asleep: AtomicU32,
    /// Keep streaming through break sequences.
    pub ignore_breaks: AtomicBool,
    /// Emit profile frames with a broken checksum.
    pub corrupt_stream: AtomicBool,
    /// Answer configuration writes with NACK.
    pub reject_writes: AtomicBool,
    /// Emit byte-identical profile frames.
    pub static_data: AtomicBool,
    pub config: Mutex<Vec<u8>>,
    pub clock: Mutex<[u8; 6]>,
    /// Every payload written to the instrument, in order.
    pub sent: Mutex<Vec<Bytes>>,
    /// Drops the transport from the instrument side.
    pub kill_switch: Notify,
    counter: AtomicU32,
}

impl MockState {
    pub fn writes_matching(&self, prefix: &[u8]) -> Vec<Bytes> {
        self.sent
            .lock()
            .iter()
            .filter(|b| b.starts_with(prefix))
            .cloned()
            .collect()
    }
}

pub struct MockProfiler {
    state: Arc<MockState>,
    cmd_tx: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl MockProfiler {
    pub fn new(mode: MockMode) -> (Box<dyn Connection>, Arc<MockState>) {
        let state = Arc::new(MockState {
            mode: Mutex::new(mode),
            silent: AtomicBool::new(false),
            asleep: AtomicU32::new(0),
            ignore_breaks: AtomicBool::new(false),
            corrupt_stream: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            static_data: AtomicBool::new(false),
            config: Mutex::new(default_config_frame()),
            clock: Mutex::new([0x00, 0x00, 0x01, 0x00, 0x26, 0x01]),
            sent: Mutex::new(Vec::new()),
            kill_switch: Notify::new(),
            counter: AtomicU32::new(0),
        });
        let conn = MockProfiler {
            state: Arc::clone(&state),
            cmd_tx: None,
            task: None,
        };
        (Box::new(conn), state)
    }
}

#[async_trait]
impl Connection for MockProfiler {
    async fn open(&mut self, sink: DataSink) -> DriverResult<()> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.cmd_tx = Some(cmd_tx);
        self.task = Some(tokio::spawn(run_instrument(
            Arc::clone(&self.state),
            sink,
            cmd_rx,
        )));
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> DriverResult<()> {
        self.state.sent.lock().push(Bytes::copy_from_slice(data));
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.cmd_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

async fn run_instrument(
    state: Arc<MockState>,
    sink: DataSink,
    mut cmd_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut ticker = interval(Duration::from_millis(50));
    let mut emitted = 0u32;
    loop {
        tokio::select! {
            _ = state.kill_switch.notified() => break,
            cmd = cmd_rx.recv() => {
                let Some(bytes) = cmd else { break };
                if state.silent.load(Ordering::Relaxed) {
                    continue;
                }
                let asleep = state.asleep.load(Ordering::Relaxed);
                if asleep > 0 {
                    state.asleep.store(asleep - 1, Ordering::Relaxed);
                    if asleep == 1 && reply(&sink, b"\r\nCommand mode\r\n").is_err() {
                        break;
                    }
                    continue;
                }
                pending.extend_from_slice(&bytes);
                if handle_commands(&state, &sink, &mut pending).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let streaming = *state.mode.lock() == MockMode::Autosample;
                if streaming && !state.silent.load(Ordering::Relaxed) {
                    emitted += 1;
                    if emit_profile(&state, &sink, emitted).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_commands(
    state: &MockState,
    sink: &DataSink,
    pending: &mut Vec<u8>,
) -> Result<(), ()> {
    loop {
        if pending.is_empty() {
            return Ok(());
        }
        if pending.starts_with(b"@@@@@@") {
            pending.drain(..6);
            continue;
        }
        if pending.starts_with(b"K1W%!Q") {
            pending.drain(..6);
            if state.ignore_breaks.load(Ordering::Relaxed) {
                continue;
            }
            let mode = *state.mode.lock();
            match mode {
                MockMode::Command => reply(sink, b"\r\nCommand mode\r\n")?,
                MockMode::Autosample | MockMode::Confirm => {
                    *state.mode.lock() = MockMode::Confirm;
                    reply(sink, b"Confirm:")?;
                }
            }
            continue;
        }
        if pending.starts_with(b"MC") {
            pending.drain(..2);
            *state.mode.lock() = MockMode::Command;
            reply(sink, b"\r\nCommand mode\r\n")?;
            continue;
        }
        if pending.starts_with(b"ID") {
            pending.drain(..2);
            reply(sink, b"\r\nAQD 9984\r\n")?;
            reply(sink, ACK)?;
            continue;
        }
        if pending.starts_with(b"BV") {
            pending.drain(..2);
            // Battery voltage in tenths of a volt, little endian.
            reply(sink, &138u16.to_le_bytes())?;
            reply(sink, ACK)?;
            continue;
        }
        if pending.starts_with(b"GC") {
            pending.drain(..2);
            let config = state.config.lock().clone();
            // Deliver the frame in two pieces to exercise reassembly.
            reply(sink, &config[..200])?;
            sleep(Duration::from_millis(2)).await;
            reply(sink, &config[200..])?;
            reply(sink, ACK)?;
            continue;
        }
        if pending.starts_with(b"CC") {
            if pending.len() < 2 + USER_CONFIG.length {
                return Ok(());
            }
            let frame = pending[2..2 + USER_CONFIG.length].to_vec();
            pending.drain(..2 + USER_CONFIG.length);
            if state.reject_writes.load(Ordering::Relaxed) || !USER_CONFIG.verify(&frame) {
                reply(sink, NACK)?;
            } else {
                *state.config.lock() = frame;
                reply(sink, ACK)?;
            }
            continue;
        }
        if pending.starts_with(b"SC") {
            if pending.len() < 8 {
                return Ok(());
            }
            let mut clock = [0u8; 6];
            clock.copy_from_slice(&pending[2..8]);
            pending.drain(..8);
            *state.clock.lock() = clock;
            reply(sink, ACK)?;
            continue;
        }
        if pending.starts_with(b"RC") {
            pending.drain(..2);
            let clock = *state.clock.lock();
            reply(sink, &clock)?;
            reply(sink, ACK)?;
            continue;
        }
        if pending.starts_with(b"ST") {
            pending.drain(..2);
            *state.mode.lock() = MockMode::Autosample;
            reply(sink, ACK)?;
            continue;
        }
        if pending.starts_with(b"AD") {
            pending.drain(..2);
            let frame = profile_frame(state);
            reply(sink, &frame)?;
            reply(sink, ACK)?;
            continue;
        }
        // Unknown byte; resync.
        pending.remove(0);
    }
}

fn reply(sink: &DataSink, data: &[u8]) -> Result<(), ()> {
    sink.send(Bytes::copy_from_slice(data)).map_err(|_| ())
}

async fn emit_profile(state: &MockState, sink: &DataSink, emitted: u32) -> Result<(), ()> {
    let frame = profile_frame(state);
    if emitted % 4 == 0 {
        // Split across two reads now and then.
        reply(sink, &frame[..10])?;
        sleep(Duration::from_millis(2)).await;
        reply(sink, &frame[10..])?;
    } else {
        reply(sink, &frame)?;
    }
    Ok(())
}

fn profile_frame(state: &MockState) -> Vec<u8> {
    let n = if state.static_data.load(Ordering::Relaxed) {
        0
    } else {
        state.counter.fetch_add(1, Ordering::Relaxed) % 50
    };
    let mut f = PROFILE.sync.to_vec();
    f.extend_from_slice(&(100 + n as u16).to_le_bytes());
    f.extend_from_slice(&200u16.to_le_bytes());
    f.extend_from_slice(&300u16.to_le_bytes());
    f.resize(PROFILE.length - 2, 0);
    let sum = codec::frame_checksum(&f);
    f.extend_from_slice(&sum.to_le_bytes());
    if state.corrupt_stream.load(Ordering::Relaxed) {
        f[5] ^= 0xFF;
    }
    f
}

pub fn default_config_frame() -> Vec<u8> {
    let mut f = USER_CONFIG.sync.to_vec();
    f.extend_from_slice(&2u16.to_le_bytes());
    f.extend_from_slice(&60u16.to_le_bytes());
    f.extend_from_slice(b"unit01");
    f.resize(USER_CONFIG.length - 2, 0);
    let sum = codec::frame_checksum(&f);
    f.extend_from_slice(&sum.to_le_bytes());
    f
}

//============================================================
// The matching protocol description
//============================================================

fn parse_name() -> ParseFn {
    Arc::new(|raw| {
        Ok(ParamValue::Str(
            String::from_utf8_lossy(raw).trim_end_matches('\0').to_owned(),
        ))
    })
}

fn format_zeros(width: usize) -> FormatFn {
    Arc::new(move |_| Ok(vec![0u8; width]))
}

fn battery_response() -> ResponseFn {
    Arc::new(|_params, raw| {
        let tenths = codec::read_u16_le(raw, 0)?;
        Ok(json!(f64::from(tenths) / 10.0))
    })
}

pub fn profiler_params() -> ParameterDict {
    let mut params = ParameterDict::new();
    params
        .add(
            Parameter::new("sample_rate", ParamType::Int)
                .with_description("measurement rate in hertz")
                .with_default(ParamValue::Int(2))
                .with_matcher(Matcher::slice(4, 2))
                .with_parse(parse_le_u16())
                .with_format(format_le_u16())
                .startup(true),
        )
        .unwrap();
    params
        .add(
            Parameter::new("avg_interval", ParamType::Int)
                .with_default(ParamValue::Int(60))
                .with_matcher(Matcher::slice(6, 2))
                .with_parse(parse_le_u16())
                .with_format(format_le_u16()),
        )
        .unwrap();
    params
        .add(
            Parameter::new("deployment_name", ParamType::Str)
                .with_default(ParamValue::Str("unit01".into()))
                .with_matcher(Matcher::slice(8, 6))
                .with_parse(parse_name())
                .with_format(format_padded_ascii(6)),
        )
        .unwrap();
    params
        .add(
            Parameter::new("padding", ParamType::Int)
                .with_default(ParamValue::Int(0))
                .with_format(format_zeros(496))
                .internal(true),
        )
        .unwrap();
    params
        .add(
            Parameter::new("status_interval", ParamType::Str)
                .with_description("HH:MM:SS between status sweeps, 00:00:00 disables")
                .with_default(ParamValue::Str("00:00:00".into())),
        )
        .unwrap();
    params
        .add(
            Parameter::new("serial_number", ParamType::Str)
                .with_visibility(Visibility::ReadOnly)
                .with_matcher(Matcher::pattern(r"AQD (\d+)").unwrap()),
        )
        .unwrap();
    params
}

pub fn profile_template() -> SampleTemplate {
    SampleTemplate {
        label: "profile",
        stream: "profile_sample",
        fields: vec![
            FieldSpec::new("heading", Matcher::slice(4, 2), parse_le_u16()),
            FieldSpec::new("pressure", Matcher::slice(6, 2), parse_le_u16()),
            FieldSpec::new("temperature", Matcher::slice(8, 2), parse_le_u16()),
        ],
    }
}

pub fn profiler_protocol() -> ProtocolBuilder {
    ProtocolBuilder::new()
        .with_params(profiler_params())
        .with_user_frame(USER_CONFIG)
        .with_break_sequence(vec![
            (Bytes::from_static(b"@@@@@@"), Duration::from_millis(20)),
            (Bytes::from_static(b"K1W%!Q"), Duration::from_millis(20)),
        ])
        .with_command_prompt(b"Command mode")
        .with_confirm(b"Confirm:", "MC")
        .command(CommandSpec::literal("MC", b"MC").expect_prompt(b"Command mode"))
        .command(
            CommandSpec::literal("ID", b"ID")
                .expect_prompt(b"\x06\x06")
                .with_error_prompt(b"\x15\x15"),
        )
        .response("ID", ascii_response())
        .command(CommandSpec::literal("BV", b"BV").expect_prompt(b"\x06\x06"))
        .response("BV", battery_response())
        .command(
            CommandSpec::literal("GC", b"GC")
                .expect_prompt(b"\x06\x06")
                .claims("user_config"),
        )
        .response("GC", config_update_response(USER_CONFIG))
        .command(
            CommandSpec::new(
                "CC",
                Payload::ConfigFrame {
                    prefix: Bytes::from_static(b"CC"),
                },
            )
            .expect_prompt(b"\x06\x06")
            .with_error_prompt(b"\x15\x15"),
        )
        .command(
            CommandSpec::new(
                "SC",
                Payload::Custom(Arc::new(|_params| {
                    let mut out = b"SC".to_vec();
                    out.extend_from_slice(&codec::encode_clock(chrono::Utc::now())?);
                    Ok(out)
                })),
            )
            .expect_prompt(b"\x06\x06"),
        )
        .command(CommandSpec::literal("RC", b"RC").expect_prompt(b"\x06\x06"))
        .response("RC", clock_read_response())
        .command(CommandSpec::literal("ST", b"ST").expect_prompt(b"\x06\x06"))
        .command(CommandSpec::literal("AD", b"AD").expect_prompt(b"\x06\x06"))
        .with_write_config("CC")
        .with_read_config("GC")
        .with_clock_commands("SC", Some("RC"))
        .with_status_commands(vec!["BV", "ID"])
        .with_sample_command("AD")
        .with_start_autosample("ST")
        .stop_autosample_via_break(true)
        .with_chunk_matcher(ChunkMatcher::Binary {
            spec: USER_CONFIG,
            lenient: true,
        })
        .with_chunk_matcher(ChunkMatcher::Binary {
            spec: PROFILE,
            lenient: true,
        })
        .with_template(profile_template())
        .scheduled_job(
            "status_sweep",
            ProtocolEvent::ScheduledAcquireStatus,
            "status_interval",
        )
}

pub fn test_settings() -> ProtocolSettings {
    ProtocolSettings {
        response_poll_interval: Duration::from_millis(10),
        default_timeout: Duration::from_secs(2),
        discovery_attempts: 2,
        discovery_delay: Duration::from_millis(300),
        wakeup_delay: Duration::from_millis(10),
        max_frame_buffer: 64 * 1024,
    }
}

//============================================================
// Drivers wired to the mock
//============================================================

/// Honors RUST_LOG; repeat calls are fine.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn driver_with(
    mode: MockMode,
    factory: ProtocolFactory,
) -> (InstrumentDriver, NotificationReceiver, Arc<MockState>) {
    init_tracing();
    let (conn, state) = MockProfiler::new(mode);
    let (driver, rx) = InstrumentDriver::new(factory, test_settings()).await;
    driver.configure(conn).await.unwrap();
    (driver, rx, state)
}

pub async fn configured_driver(
    mode: MockMode,
) -> (InstrumentDriver, NotificationReceiver, Arc<MockState>) {
    driver_with(mode, Box::new(profiler_protocol)).await
}

/// Configured, connected and discovered into command mode.
pub async fn command_driver() -> (InstrumentDriver, NotificationReceiver, Arc<MockState>) {
    let (driver, rx, state) = configured_driver(MockMode::Command).await;
    driver.connect().await.unwrap();
    driver.discover().await.unwrap();
    (driver, rx, state)
}

//============================================================
// Notification plumbing
//============================================================

pub async fn await_kind(rx: &mut NotificationReceiver, kind: NotificationKind) -> Notification {
    timeout(Duration::from_secs(5), async {
        loop {
            let note = rx.recv().await.expect("notification channel closed");
            if note.kind == kind {
                return note;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// Pull everything currently queued and keep only `kind`.
pub fn drain_kind(rx: &mut NotificationReceiver, kind: NotificationKind) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(note) = rx.try_recv() {
        if note.kind == kind {
            out.push(note);
        }
    }
    out
}
