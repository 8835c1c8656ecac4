//! Turns framed chunks into published samples.
//!
//! A [`SampleRouter`] owns one [`SampleTemplate`] per chunk label it
//! cares about. Routing a chunk extracts the template's fields,
//! attaches a quality flag from the chunker's checksum verdict, and
//! broadcasts the sample as a [`NotificationKind::Sample`] event.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use seadaq_core::{DriverResult, Notification, NotificationKind, NotificationSender};

use crate::chunker::Chunk;
use crate::params::{Matcher, ParseFn};

/// One extracted field of a sample stream.
#[derive(Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub matcher: Matcher,
    pub parse: ParseFn,
}

impl FieldSpec {
    pub fn new(name: &'static str, matcher: Matcher, parse: ParseFn) -> Self {
        Self {
            name,
            matcher,
            parse,
        }
    }
}

/// How chunks of one label become samples on one stream.
#[derive(Clone)]
pub struct SampleTemplate {
    /// Chunk label this template consumes.
    pub label: &'static str,
    /// Stream name stamped on published samples.
    pub stream: &'static str,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityFlag {
    Ok,
    ChecksumFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub stream: &'static str,
    pub quality: QualityFlag,
    pub time: DateTime<Utc>,
    /// Field values; fields whose matcher found nothing are absent.
    pub values: BTreeMap<&'static str, Value>,
}

/// Routes chunks to sample templates and publishes the results.
///
/// Duplicate suppression, when enabled, compares each chunk's raw bytes
/// against the previous chunk routed through this instance. Every
/// router keeps its own last-chunk memory, so two instruments producing
/// identical output do not mask each other.
pub struct SampleRouter {
    templates: HashMap<&'static str, SampleTemplate>,
    dedup: bool,
    last_raw: Option<Bytes>,
    notifier: NotificationSender,
}

impl SampleRouter {
    pub fn new(templates: Vec<SampleTemplate>, notifier: NotificationSender) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.label, t)).collect(),
            dedup: false,
            last_raw: None,
            notifier,
        }
    }

    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    /// Route one chunk. Returns the published sample, or `None` when no
    /// template matched the label or the chunk was a suppressed
    /// duplicate. Samples are stamped with the routing time.
    pub fn route(&mut self, chunk: &Chunk) -> DriverResult<Option<Sample>> {
        let Some(template) = self.templates.get(chunk.label) else {
            return Ok(None);
        };
        if self.dedup {
            if self.last_raw.as_deref() == Some(&chunk.data[..]) {
                debug!(stream = template.stream, "suppressed duplicate sample");
                return Ok(None);
            }
            self.last_raw = Some(chunk.data.clone());
        }

        let mut values = BTreeMap::new();
        for field in &template.fields {
            let Some(raw) = field.matcher.capture(&chunk.data) else {
                continue;
            };
            let value = (field.parse)(raw)?;
            values.insert(field.name, value.as_json());
        }

        let sample = Sample {
            stream: template.stream,
            quality: if chunk.checksum_ok {
                QualityFlag::Ok
            } else {
                QualityFlag::ChecksumFailed
            },
            time: Utc::now(),
            values,
        };
        let payload = serde_json::to_value(&sample).unwrap_or(Value::Null);
        let _ = self
            .notifier
            .send(Notification::new(NotificationKind::Sample, payload));
        Ok(Some(sample))
    }
}
