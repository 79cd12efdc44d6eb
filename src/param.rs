//! Parameter values and the generators that produce them.

use crate::{
    generator::{ByteArrayConfig, ByteArrayGenerator},
    invoke::ExecutionResult,
    mutators::{INTERESTING_16, INTERESTING_32, INTERESTING_8},
    queue::QueueEntry,
    Result,
};
use std::{fmt, sync::Arc};

/// A value passed to, or returned from, a target.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The unit value.
    Unit,
    /// A boolean.
    Bool(bool),
    /// An 8-bit integer.
    I8(i8),
    /// A 16-bit integer.
    I16(i16),
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// A byte buffer.
    Bytes(Vec<u8>),
    /// A string.
    Str(String),
}

/// The kind of a [`Value`], used to describe a target's signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ValueKind {
    Unit,
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bytes,
    Str,
}

impl Value {
    /// This value's kind.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unit => ValueKind::Unit,
            Value::Bool(_) => ValueKind::Bool,
            Value::I8(_) => ValueKind::I8,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Str(_) => ValueKind::Str,
        }
    }

    /// The raw bytes of a [`Bytes`][Value::Bytes] or [`Str`][Value::Str]
    /// value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "{v:02x?}"),
            Value::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// A generated parameter.
///
/// Values from mutational generators carry the queue entry they were derived
/// from, so that their execution results can be attributed back to it.
#[derive(Clone, Debug)]
pub enum Param {
    /// A plain value.
    Raw(Value),
    /// A value derived from a seed in a generator's input queue.
    Tracked {
        /// The value.
        value: Value,
        /// The seed it was derived from.
        entry: Arc<QueueEntry>,
    },
}

impl Param {
    /// The value, without its origin.
    pub fn value(&self) -> &Value {
        match self {
            Param::Raw(value) | Param::Tracked { value, .. } => value,
        }
    }

    /// The queue entry this value was derived from, if any.
    pub fn entry(&self) -> Option<&Arc<QueueEntry>> {
        match self {
            Param::Raw(_) => None,
            Param::Tracked { entry, .. } => Some(entry),
        }
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Param::Raw(value)
    }
}

/// A restartable source of values for one target parameter.
pub trait ParamGen: Send + Sync {
    /// A fresh pass over this generator's values.
    ///
    /// Finite generators yield the same values on every pass; mutational ones
    /// yield a stream that only ends if the generator runs dry.
    fn values(self: Arc<Self>) -> Box<dyn Iterator<Item = Param> + Send>;

    /// The number of values in one pass, if it is finite and known.
    fn finite_len(&self) -> Option<usize> {
        None
    }

    /// Whether this generator mutates seeds in response to feedback rather
    /// than enumerating a fixed set.
    fn is_mutational(&self) -> bool {
        false
    }

    /// Feedback for an executed tuple, where this generator produced
    /// `result.params[index]`.
    ///
    /// Called exactly once for every executed tuple, never for tuples that
    /// were generated but not run.
    fn on_result(&self, result: &ExecutionResult, index: usize) -> Result<()> {
        let _ = (result, index);
        Ok(())
    }

    /// Release this generator's resources.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A generator that enumerates a fixed list of values.
#[derive(Clone, Debug, PartialEq)]
pub struct Fixed {
    values: Arc<[Value]>,
}

impl Fixed {
    /// A generator over `values`.
    pub fn new(values: impl Into<Arc<[Value]>>) -> Self {
        Self {
            values: values.into(),
        }
    }

    /// The values, in order.
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}

impl ParamGen for Fixed {
    fn values(self: Arc<Self>) -> Box<dyn Iterator<Item = Param> + Send> {
        let values = self.values.clone();
        Box::new((0..values.len()).map(move |i| Param::Raw(values[i].clone())))
    }

    fn finite_len(&self) -> Option<usize> {
        Some(self.values.len())
    }
}

/// Suggested small integers: every value in `-35..=35`.
fn small_ints() -> impl Iterator<Item = i64> {
    -35i64..=35
}

fn suggested_i64s(width: u32) -> Vec<i64> {
    let mut out: Vec<i64> = small_ints().collect();
    out.extend(INTERESTING_8.iter().map(|v| i64::from(*v)));
    if width >= 16 {
        out.extend(INTERESTING_16.iter().map(|v| i64::from(*v)));
    }
    if width >= 32 {
        out.extend(INTERESTING_32.iter().map(|v| i64::from(*v)));
    }
    if width >= 64 {
        out.extend([i64::MIN, i64::MAX]);
    }
    out
}

fn suggested_f32s() -> Vec<f32> {
    let mut out: Vec<f32> = small_ints().map(|v| v as f32).collect();
    out.extend([
        f32::MIN_POSITIVE,
        f32::from_bits(1),
        f32::MAX,
        f32::NEG_INFINITY,
        f32::INFINITY,
        f32::NAN,
    ]);
    out
}

/// The suggested fixed values for a scalar kind, or `None` for
/// [`Bytes`][ValueKind::Bytes] and [`Str`][ValueKind::Str].
///
/// Integers get every value in `-35..=35` plus the interesting values of
/// their width and every narrower width. Floats get the same small range
/// plus their special values.
///
/// ```
/// use covfuzz::{param::suggested_values, ValueKind};
///
/// assert_eq!(suggested_values(ValueKind::Bool).unwrap().len(), 2);
/// assert_eq!(suggested_values(ValueKind::I32).unwrap().len(), 98);
/// assert!(suggested_values(ValueKind::Bytes).is_none());
/// ```
pub fn suggested_values(kind: ValueKind) -> Option<Vec<Value>> {
    Some(match kind {
        ValueKind::Unit => vec![Value::Unit],
        ValueKind::Bool => vec![Value::Bool(true), Value::Bool(false)],
        ValueKind::I8 => suggested_i64s(8)
            .into_iter()
            .map(|v| Value::I8(v as i8))
            .collect(),
        ValueKind::I16 => suggested_i64s(16)
            .into_iter()
            .map(|v| Value::I16(v as i16))
            .collect(),
        ValueKind::I32 => suggested_i64s(32)
            .into_iter()
            .map(|v| Value::I32(v as i32))
            .collect(),
        ValueKind::I64 => suggested_i64s(64).into_iter().map(Value::I64).collect(),
        ValueKind::F32 => suggested_f32s().into_iter().map(Value::F32).collect(),
        ValueKind::F64 => {
            let mut out: Vec<Value> = suggested_f32s()
                .into_iter()
                .map(|v| Value::F64(f64::from(v)))
                .collect();
            out.extend(
                [
                    f64::MIN_POSITIVE,
                    f64::from_bits(1),
                    f64::MAX,
                    f64::NEG_INFINITY,
                    f64::INFINITY,
                    f64::NAN,
                ]
                .map(Value::F64),
            );
            out
        }
        ValueKind::Bytes | ValueKind::Str => return None,
    })
}

/// The suggested generator for a parameter of `kind`.
///
/// Scalars get a [`Fixed`] generator over [`suggested_values`]; byte buffers
/// get a [`ByteArrayGenerator`] built from `config`, and strings a
/// [`Utf8Generator`] over one.
pub fn suggested(kind: ValueKind, config: &ByteArrayConfig) -> Result<Arc<dyn ParamGen>> {
    if let Some(values) = suggested_values(kind) {
        return Ok(Arc::new(Fixed::new(values)));
    }
    let bytes = Arc::new(ByteArrayGenerator::new(config.clone())?);
    Ok(match kind {
        ValueKind::Str => Arc::new(Utf8Generator::new(bytes)),
        _ => bytes,
    })
}

/// A string generator layered over a byte-array generator.
///
/// Invalid UTF-8 is replaced with U+FFFD. Feedback is forwarded to the byte
/// generator, which learns from the string's encoded bytes.
#[derive(Debug)]
pub struct Utf8Generator {
    bytes: Arc<ByteArrayGenerator>,
}

impl Utf8Generator {
    /// Wrap `bytes`.
    pub fn new(bytes: Arc<ByteArrayGenerator>) -> Self {
        Self { bytes }
    }
}

impl ParamGen for Utf8Generator {
    fn values(self: Arc<Self>) -> Box<dyn Iterator<Item = Param> + Send> {
        fn to_str(value: &Value) -> Value {
            let bytes = value.as_bytes().unwrap_or_default();
            Value::Str(String::from_utf8_lossy(bytes).into_owned())
        }

        Box::new(self.bytes.clone().values().map(|param| match param {
            Param::Raw(value) => Param::Raw(to_str(&value)),
            Param::Tracked { value, entry } => Param::Tracked {
                value: to_str(&value),
                entry,
            },
        }))
    }

    fn is_mutational(&self) -> bool {
        true
    }

    fn on_result(&self, result: &ExecutionResult, index: usize) -> Result<()> {
        self.bytes.on_result(result, index)
    }

    fn close(&self) -> Result<()> {
        self.bytes.close()
    }
}
