//! Error taxonomy for the instrument-communication engine.
//!
//! Every fallible operation in the engine returns [`DriverResult`]. The
//! variants follow the failure classes the engine distinguishes: bad
//! declarations, illegal FSM events, missed prompts, garbled instrument
//! traffic, and parameter misuse. Connection loss is not an error; it is
//! delivered as an explicit connection-FSM event because it arrives
//! asynchronously.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type DriverResult<T> = std::result::Result<T, InstrumentError>;

/// Errors surfaced by the instrument-communication engine.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// A malformed declaration: bad job trigger, duplicate parameter name,
    /// inconsistent frame table, unloadable settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The dispatched event has no handler in the FSM's current state.
    /// The state is left unchanged.
    #[error("event {event} not legal in state {state}")]
    State {
        /// Current state at dispatch time.
        state: String,
        /// The rejected event.
        event: String,
    },

    /// An expected prompt (or other awaited condition) did not appear
    /// within the deadline.
    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        /// How long the engine waited.
        after: Duration,
        /// What it was waiting for.
        waiting_for: String,
    },

    /// Instrument traffic the engine could not accept: checksum mismatch,
    /// unrecognized response, discovery that never settled.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A parameter name the store does not know.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// A write attempt on a read-only parameter. The stored value is
    /// never mutated by the rejected call.
    #[error("parameter '{0}' is read-only")]
    ParameterReadOnly(String),

    /// The supplied value's runtime type disagrees with the parameter's
    /// declared type.
    #[error("parameter '{name}' expects {expected}, got {actual}")]
    ParameterType {
        /// Parameter being written.
        name: String,
        /// Declared type.
        expected: String,
        /// Type of the rejected value.
        actual: String,
    },

    /// Any other parameter-shaped failure: no value available yet,
    /// a format function that cannot render the value, a matcher that
    /// cannot apply to the buffer.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Transport-level failure reported by the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstrumentError {
    /// Build a [`InstrumentError::State`] from the debug forms of a
    /// state and event pair.
    pub fn state<S: fmt::Debug, E: fmt::Debug>(state: &S, event: &E) -> Self {
        InstrumentError::State {
            state: format!("{state:?}"),
            event: format!("{event:?}"),
        }
    }

    /// Build a [`InstrumentError::Timeout`].
    pub fn timeout(after: Duration, waiting_for: impl Into<String>) -> Self {
        InstrumentError::Timeout {
            after,
            waiting_for: waiting_for.into(),
        }
    }

    /// True for [`InstrumentError::Timeout`]. Callers implementing retry
    /// policies branch on this rather than matching the full variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        let err = InstrumentError::Configuration("interval must be non-zero".into());
        assert_eq!(
            err.to_string(),
            "configuration error: interval must be non-zero"
        );

        let err = InstrumentError::State {
            state: "COMMAND".into(),
            event: "STOP_AUTOSAMPLE".into(),
        };
        assert_eq!(err.to_string(), "event STOP_AUTOSAMPLE not legal in state COMMAND");

        let err = InstrumentError::ParameterReadOnly("SERIAL_NUMBER".into());
        assert_eq!(err.to_string(), "parameter 'SERIAL_NUMBER' is read-only");

        let err = InstrumentError::ParameterType {
            name: "AVG_INTERVAL".into(),
            expected: "INT".into(),
            actual: "STRING".into(),
        };
        assert_eq!(err.to_string(), "parameter 'AVG_INTERVAL' expects INT, got STRING");
    }

    #[test]
    fn timeout_predicate() {
        let err = InstrumentError::timeout(Duration::from_secs(5), "prompt ACK");
        assert!(err.is_timeout());
        assert!(!InstrumentError::Protocol("bad frame".into()).is_timeout());
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: InstrumentError = io.into();
        assert!(matches!(err, InstrumentError::Io(_)));
    }
}
