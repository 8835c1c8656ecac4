//! Typed instrument parameters and the per-protocol parameter store.
//!
//! Every protocol owns a [`ParameterDict`] describing the knobs the
//! instrument exposes: name, type, visibility, how to pull the value
//! out of instrument output, and how to render it back into a config
//! frame. The dict preserves declaration order, which doubles as the
//! field order of binary config frames built by
//! [`ParameterDict::build_frame`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::bytes::Regex;
use serde::Serialize;
use serde_json::Value;

use seadaq_core::{DriverResult, InstrumentError};

use crate::codec::{self, FrameSpec};

//============================================================
// Values and metadata
//============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    #[serde(rename = "string")]
    Str,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Int => write!(f, "int"),
            ParamType::Float => write!(f, "float"),
            ParamType::Str => write!(f, "string"),
        }
    }
}

/// A parameter value. Comparisons are exact; change detection in
/// [`ParameterDict::set_from_value`] relies on that.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Str(_) => ParamType::Str,
        }
    }

    pub fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Convert a JSON value to the declared parameter type. Integers
    /// widen to floats; nothing else coerces.
    pub fn coerce(name: &str, ty: ParamType, value: &Value) -> DriverResult<ParamValue> {
        let mismatch = || InstrumentError::ParameterType {
            name: name.to_owned(),
            expected: ty.to_string(),
            actual: value.to_string(),
        };
        match ty {
            ParamType::Int => value.as_i64().map(ParamValue::Int).ok_or_else(mismatch),
            ParamType::Float => value.as_f64().map(ParamValue::Float).ok_or_else(mismatch),
            ParamType::Str => value
                .as_str()
                .map(|s| ParamValue::Str(s.to_owned()))
                .ok_or_else(mismatch),
        }
    }

    pub fn as_int(&self) -> DriverResult<i64> {
        match self {
            ParamValue::Int(n) => Ok(*n),
            other => Err(InstrumentError::Parameter(format!(
                "expected an int value, got {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> DriverResult<&str> {
        match self {
            ParamValue::Str(s) => Ok(s),
            other => Err(InstrumentError::Parameter(format!(
                "expected a string value, got {other}"
            ))),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(n) => write!(f, "{n}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Who may write a parameter, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    ReadWrite,
    /// Never writable through the driver.
    ReadOnly,
    /// Writable only until startup values have been applied.
    Immutable,
    /// Writable only from a direct-access session.
    DirectAccess,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::ReadWrite => "READ_WRITE",
            Visibility::ReadOnly => "READ_ONLY",
            Visibility::Immutable => "IMMUTABLE",
            Visibility::DirectAccess => "DIRECT_ACCESS",
        }
    }
}

/// Which slot [`ParameterDict::update`] writes extracted values into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    /// Live value, as read back from the instrument.
    Current,
    /// Staged initialization value, applied on startup.
    Init,
}

/// What an update run touched. A parameter can match without changing;
/// the two lists keep those apart.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Names whose matcher found a field, in declaration order.
    pub matched: Vec<String>,
    /// Names whose live value changed; always empty for
    /// [`UpdateTarget::Init`].
    pub changed: Vec<String>,
}

impl UpdateReport {
    /// Whether at least one parameter matched the data.
    pub fn any_matched(&self) -> bool {
        !self.matched.is_empty()
    }
}

//============================================================
// Extraction and rendering
//============================================================

/// Locates a parameter's raw bytes inside instrument output. Returns
/// `None` when the field is simply absent from this piece of output.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Byte regex; capture group 1 when the pattern has one, otherwise
    /// the whole match.
    Pattern(Regex),
    /// Fixed-position field of a binary frame.
    Slice { offset: usize, len: usize },
}

impl Matcher {
    pub fn pattern(re: &str) -> DriverResult<Self> {
        Regex::new(re)
            .map(Matcher::Pattern)
            .map_err(|e| InstrumentError::Configuration(format!("bad matcher pattern: {e}")))
    }

    pub fn slice(offset: usize, len: usize) -> Self {
        Matcher::Slice { offset, len }
    }

    pub fn capture<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            Matcher::Pattern(re) => re
                .captures(data)
                .and_then(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| m.as_bytes()),
            Matcher::Slice { offset, len } => data.get(*offset..offset + len),
        }
    }
}

pub type ParseFn = Arc<dyn Fn(&[u8]) -> DriverResult<ParamValue> + Send + Sync>;
pub type FormatFn = Arc<dyn Fn(&ParamValue) -> DriverResult<Vec<u8>> + Send + Sync>;

pub fn parse_le_u16() -> ParseFn {
    Arc::new(|raw| Ok(ParamValue::Int(codec::read_u16_le(raw, 0)? as i64)))
}

pub fn format_le_u16() -> FormatFn {
    Arc::new(|value| {
        let n = value.as_int()?;
        if !(0..=0xFFFF).contains(&n) {
            return Err(InstrumentError::Parameter(format!(
                "{n} does not fit in a 16-bit field"
            )));
        }
        Ok((n as u16).to_le_bytes().to_vec())
    })
}

pub fn parse_le_u32() -> ParseFn {
    Arc::new(|raw| Ok(ParamValue::Int(codec::read_u32_le(raw, 0)? as i64)))
}

pub fn format_le_u32() -> FormatFn {
    Arc::new(|value| {
        let n = value.as_int()?;
        if !(0..=0xFFFF_FFFF).contains(&n) {
            return Err(InstrumentError::Parameter(format!(
                "{n} does not fit in a 32-bit field"
            )));
        }
        Ok((n as u32).to_le_bytes().to_vec())
    })
}

pub fn parse_ascii_int() -> ParseFn {
    Arc::new(|raw| {
        let text = String::from_utf8_lossy(raw);
        text.trim()
            .parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|_| InstrumentError::Parameter(format!("'{}' is not an integer", text.trim())))
    })
}

pub fn parse_ascii_float() -> ParseFn {
    Arc::new(|raw| {
        let text = String::from_utf8_lossy(raw);
        text.trim()
            .parse::<f64>()
            .map(ParamValue::Float)
            .map_err(|_| InstrumentError::Parameter(format!("'{}' is not a number", text.trim())))
    })
}

pub fn parse_ascii() -> ParseFn {
    Arc::new(|raw| Ok(ParamValue::Str(String::from_utf8_lossy(raw).trim().to_owned())))
}

/// Render a string value as bytes zero-padded to `width`.
pub fn format_padded_ascii(width: usize) -> FormatFn {
    Arc::new(move |value| {
        let s = value.as_str()?;
        if s.len() > width {
            return Err(InstrumentError::Parameter(format!(
                "'{s}' exceeds the {width}-byte field"
            )));
        }
        let mut out = s.as_bytes().to_vec();
        out.resize(width, 0);
        Ok(out)
    })
}

fn default_parse(ty: ParamType, raw: &[u8]) -> DriverResult<ParamValue> {
    match ty {
        ParamType::Int => parse_ascii_int()(raw),
        ParamType::Float => parse_ascii_float()(raw),
        ParamType::Str => parse_ascii()(raw),
    }
}

//============================================================
// Parameters
//============================================================

/// One instrument parameter. Built with the `with_` methods:
///
/// ```ignore
/// Parameter::new("sample_rate", ParamType::Int)
///     .with_default(ParamValue::Int(2))
///     .with_matcher(Matcher::slice(6, 2))
///     .with_parse(parse_le_u16())
///     .with_format(format_le_u16())
///     .startup(true)
/// ```
#[derive(Clone)]
pub struct Parameter {
    name: String,
    ty: ParamType,
    visibility: Visibility,
    startup: bool,
    internal: bool,
    description: Option<String>,
    default: Option<ParamValue>,
    init_value: Option<ParamValue>,
    value: Option<ParamValue>,
    matcher: Option<Matcher>,
    parse: Option<ParseFn>,
    format: Option<FormatFn>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            visibility: Visibility::default(),
            startup: false,
            internal: false,
            description: None,
            default: None,
            init_value: None,
            value: None,
            matcher: None,
            parse: None,
            format: None,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn with_default(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_parse(mut self, parse: ParseFn) -> Self {
        self.parse = Some(parse);
        self
    }

    pub fn with_format(mut self, format: FormatFn) -> Self {
        self.format = Some(format);
        self
    }

    /// Mark the parameter for application during protocol startup.
    pub fn startup(mut self, startup: bool) -> Self {
        self.startup = startup;
        self
    }

    /// Internal fields (padding, spares) are kept for frame layout but
    /// hidden from configuration reports.
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_type(&self) -> ParamType {
        self.ty
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_startup(&self) -> bool {
        self.startup
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Live value, falling back to the staged init value, then the
    /// default.
    pub fn current_value(&self) -> Option<&ParamValue> {
        self.value
            .as_ref()
            .or(self.init_value.as_ref())
            .or(self.default.as_ref())
    }

    pub fn init_value(&self) -> Option<&ParamValue> {
        self.init_value.as_ref().or(self.default.as_ref())
    }
}

//============================================================
// The store
//============================================================

/// Ordered parameter store.
#[derive(Clone, Default)]
pub struct ParameterDict {
    entries: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parameter: Parameter) -> DriverResult<()> {
        if self.index.contains_key(parameter.name()) {
            return Err(InstrumentError::Configuration(format!(
                "parameter '{}' declared twice",
                parameter.name()
            )));
        }
        self.index
            .insert(parameter.name().to_owned(), self.entries.len());
        self.entries.push(parameter);
        Ok(())
    }

    /// Names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|p| p.name()).collect()
    }

    pub fn get(&self, name: &str) -> DriverResult<&Parameter> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| InstrumentError::UnknownParameter(name.to_owned()))
    }

    fn get_mut(&mut self, name: &str) -> DriverResult<&mut Parameter> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.entries[i]),
            None => Err(InstrumentError::UnknownParameter(name.to_owned())),
        }
    }

    /// Set a live value, reporting whether it differed from the
    /// previous effective value. Read-only parameters are rejected
    /// here; the finer visibility rules (immutable after startup,
    /// direct-access only) are the protocol's business.
    pub fn set_from_value(&mut self, name: &str, value: ParamValue) -> DriverResult<bool> {
        let parameter = self.get_mut(name)?;
        if parameter.ty != value.kind() {
            return Err(InstrumentError::ParameterType {
                name: name.to_owned(),
                expected: parameter.ty.to_string(),
                actual: value.kind().to_string(),
            });
        }
        if parameter.visibility == Visibility::ReadOnly {
            return Err(InstrumentError::ParameterReadOnly(name.to_owned()));
        }
        let changed = parameter.current_value() != Some(&value);
        parameter.value = Some(value);
        Ok(changed)
    }

    /// Stage an init value for startup application.
    pub fn set_init(&mut self, name: &str, value: ParamValue) -> DriverResult<()> {
        let parameter = self.get_mut(name)?;
        if parameter.ty != value.kind() {
            return Err(InstrumentError::ParameterType {
                name: name.to_owned(),
                expected: parameter.ty.to_string(),
                actual: value.kind().to_string(),
            });
        }
        parameter.init_value = Some(value);
        Ok(())
    }

    /// Run every parameter's matcher over `data` and store whatever
    /// was found. Parameters whose matcher finds nothing are left
    /// untouched; the report says which names matched and which of
    /// those actually changed.
    pub fn update(&mut self, data: &[u8], target: UpdateTarget) -> DriverResult<UpdateReport> {
        self.update_filtered(data, None, target)
    }

    /// Like [`update`](Self::update), restricted to `names`. Unknown
    /// names fail before anything is stored.
    pub fn update_named(
        &mut self,
        data: &[u8],
        names: &[&str],
        target: UpdateTarget,
    ) -> DriverResult<UpdateReport> {
        for name in names {
            self.get(name)?;
        }
        self.update_filtered(data, Some(names), target)
    }

    fn update_filtered(
        &mut self,
        data: &[u8],
        names: Option<&[&str]>,
        target: UpdateTarget,
    ) -> DriverResult<UpdateReport> {
        let mut report = UpdateReport::default();
        for parameter in &mut self.entries {
            if let Some(names) = names {
                if !names.contains(&parameter.name.as_str()) {
                    continue;
                }
            }
            let Some(matcher) = &parameter.matcher else {
                continue;
            };
            let Some(raw) = matcher.capture(data) else {
                continue;
            };
            let value = match &parameter.parse {
                Some(parse) => parse(raw)?,
                None => default_parse(parameter.ty, raw)?,
            };
            report.matched.push(parameter.name.clone());
            match target {
                UpdateTarget::Init => parameter.init_value = Some(value),
                UpdateTarget::Current => {
                    if parameter.current_value() != Some(&value) {
                        report.changed.push(parameter.name.clone());
                    }
                    parameter.value = Some(value);
                }
            }
        }
        Ok(report)
    }

    /// Externally visible configuration: every non-internal parameter
    /// with an effective value.
    pub fn get_config(&self) -> Value {
        let mut map = serde_json::Map::new();
        for parameter in &self.entries {
            if parameter.internal {
                continue;
            }
            if let Some(value) = parameter.current_value() {
                map.insert(parameter.name.clone(), value.as_json());
            }
        }
        Value::Object(map)
    }

    /// Per-parameter metadata for capability reporting.
    pub fn get_metadata(&self) -> Value {
        let mut map = serde_json::Map::new();
        for parameter in &self.entries {
            if parameter.internal {
                continue;
            }
            map.insert(
                parameter.name.clone(),
                serde_json::json!({
                    "type": parameter.ty,
                    "visibility": parameter.visibility.as_str(),
                    "startup": parameter.startup,
                    "description": parameter.description,
                }),
            );
        }
        Value::Object(map)
    }

    /// Startup parameters with a value to apply, in declaration order.
    pub fn startup_values(&self) -> Vec<(String, ParamValue)> {
        self.entries
            .iter()
            .filter(|p| p.startup)
            .filter_map(|p| p.init_value().map(|v| (p.name.clone(), v.clone())))
            .collect()
    }

    /// Render the binary config frame for `spec`: sync prefix, then
    /// each formattable parameter in declaration order, then the
    /// trailing checksum. The result must land exactly on the declared
    /// frame length.
    pub fn build_frame(&self, spec: &FrameSpec) -> DriverResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(spec.length);
        frame.extend_from_slice(spec.sync);
        for parameter in &self.entries {
            let Some(format) = &parameter.format else {
                continue;
            };
            let value = parameter.current_value().ok_or_else(|| {
                InstrumentError::Parameter(format!(
                    "'{}' has no value to put in the {} frame",
                    parameter.name, spec.label
                ))
            })?;
            frame.extend_from_slice(&format(value)?);
        }
        if frame.len() + 2 != spec.length {
            return Err(InstrumentError::Configuration(format!(
                "{} frame came out at {} bytes, layout says {}",
                spec.label,
                frame.len() + 2,
                spec.length
            )));
        }
        let sum = codec::frame_checksum(&frame);
        frame.extend_from_slice(&sum.to_le_bytes());
        Ok(frame)
    }
}
