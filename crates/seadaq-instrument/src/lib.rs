//! Instrument driver engine: transport and protocol state machines,
//! frame chunking, sample routing, and the typed parameter store.
//!
//! The shape of a driver:
//!
//! * implement [`connection::Connection`] for the transport,
//! * describe the instrument with a [`protocol::ProtocolBuilder`]
//!   (commands, prompts, parameters, frame shapes, scheduled jobs),
//! * run it behind an [`driver::InstrumentDriver`], which owns the
//!   connection lifecycle and forwards instrument operations into the
//!   protocol session.
//!
//! Everything observable (state changes, samples, configuration
//! updates, errors, direct-access output) is published as
//! [`seadaq_core::Notification`]s on one broadcast channel.

pub mod chunker;
pub mod codec;
pub mod connection;
pub mod driver;
pub mod params;
pub mod protocol;
pub mod sample;
pub mod settings;

pub use chunker::{Chunk, ChunkMatcher, Chunker, ClaimedRange};
pub use codec::FrameSpec;
pub use connection::{data_channel, share, Connection, DataSink, DataStream, SharedConnection};
pub use driver::{ConnectionEvent, ConnectionState, InstrumentDriver, ProtocolFactory};
pub use params::{
    format_le_u16, format_le_u32, format_padded_ascii, parse_ascii, parse_ascii_float,
    parse_ascii_int, parse_le_u16, parse_le_u32, Matcher, ParamType, ParamValue, Parameter,
    ParameterDict, UpdateReport, UpdateTarget, Visibility,
};
pub use protocol::{
    ascii_response, clock_read_response, config_update_response, CommandSpec, EventArgs, Expect,
    Payload, Protocol, ProtocolBuilder, ProtocolEvent, ProtocolState, ResponseFn, ScheduledJob,
};
pub use sample::{FieldSpec, QualityFlag, Sample, SampleRouter, SampleTemplate};
pub use settings::ProtocolSettings;
