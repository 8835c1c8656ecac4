//! Core building blocks for instrument drivers.
//!
//! This crate is deliberately free of any instrument specifics. It
//! provides the three mechanisms every driver is assembled from:
//!
//! - [`fsm`]: explicit-table async state machines with enter/exit
//!   dispatch, plus the mutex-wrapped [`fsm::SharedMachine`] drivers
//!   run on.
//! - [`scheduler`]: named timer jobs (absolute, cron, interval and
//!   polled-interval triggers) for clock syncs, status sweeps and
//!   similar housekeeping.
//! - [`event`]: the broadcast notification fan-out through which
//!   drivers report state changes, samples and errors to observers.
//!
//! Errors across all of them share [`error::InstrumentError`].

pub mod error;
pub mod event;
pub mod fsm;
pub mod scheduler;

pub use error::{DriverResult, InstrumentError};
pub use event::{
    notification_channel, Notification, NotificationKind, NotificationReceiver, NotificationSender,
};
pub use fsm::{Handled, Handler, MachineBuilder, MachineEvent, MachineState, SharedMachine, StateMachine};
pub use scheduler::{CronSpec, JobCallback, Scheduler, Trigger};
