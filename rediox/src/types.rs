use std::fmt;
use std::str::from_utf8;

use num_bigint::BigInt;

use crate::errors::{make_server_error, Error, ErrorKind, RedioxResult};

/// The version of the wire protocol negotiated with the server.
///
/// `Resp3` is negotiated at handshake time with `HELLO 3` and unlocks the
/// extended reply types (maps, sets, doubles, booleans, pushes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// The legacy protocol. Every server speaks it.
    #[default]
    Resp2,
    /// The extended protocol.
    Resp3,
}

/// Kinds of out-of-band push messages.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)] // the variants mirror the wire-level kind strings
pub enum PushKind {
    Message,
    PMessage,
    SMessage,
    Subscribe,
    PSubscribe,
    SSubscribe,
    Unsubscribe,
    PUnsubscribe,
    SUnsubscribe,
    Other(String),
}

impl PushKind {
    pub(crate) fn from_kind_str(kind: &str) -> PushKind {
        match kind {
            "message" => PushKind::Message,
            "pmessage" => PushKind::PMessage,
            "smessage" => PushKind::SMessage,
            "subscribe" => PushKind::Subscribe,
            "psubscribe" => PushKind::PSubscribe,
            "ssubscribe" => PushKind::SSubscribe,
            "unsubscribe" => PushKind::Unsubscribe,
            "punsubscribe" => PushKind::PUnsubscribe,
            "sunsubscribe" => PushKind::SUnsubscribe,
            other => PushKind::Other(other.to_string()),
        }
    }
}

/// The format attached to a verbatim string reply.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum VerbatimFormat {
    Text,
    Markdown,
    Unknown(String),
}

/// An error reply carried in-band inside an aggregate reply.
///
/// Top-level error replies are surfaced as [`Error`]; errors nested inside
/// arrays (most notably `EXEC` results) stay in the value tree so a pipeline
/// can report per-command outcomes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    pub(crate) code: String,
    pub(crate) detail: String,
}

impl ServerError {
    /// Builds an error reply value, mainly useful for scripted test servers.
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> ServerError {
        ServerError {
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// The error code, e.g. `ERR` or `MOVED`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The remainder of the error line.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Error {
        make_server_error(&err.code, &err.detail)
    }
}

/// A single reply value.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// A nil reply.
    Nil,
    /// An integer reply.
    Int(i64),
    /// A binary-safe string reply.
    BulkString(Vec<u8>),
    /// An ordered aggregate of replies.
    Array(Vec<Value>),
    /// A simple (status line) string reply.
    SimpleString(String),
    /// The `+OK` status reply, special-cased because it is so common.
    Okay,
    /// A map reply (RESP3), kept as pairs to preserve server order.
    Map(Vec<(Value, Value)>),
    /// A set reply (RESP3).
    Set(Vec<Value>),
    /// A double reply (RESP3).
    Double(f64),
    /// A boolean reply (RESP3).
    Boolean(bool),
    /// A verbatim string reply (RESP3).
    VerbatimString {
        format: VerbatimFormat,
        text: String,
    },
    /// An arbitrarily large integer reply (RESP3).
    BigNumber(BigInt),
    /// An out-of-band push message (RESP3).
    Push { kind: PushKind, data: Vec<Value> },
    /// An error reply nested inside an aggregate reply.
    ServerError(ServerError),
}

impl Value {
    /// Checks whether the value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Converts a top-level error reply into `Err`, passing every other value
    /// through untouched. Nested errors stay in place.
    pub fn extract_error(self) -> RedioxResult<Value> {
        match self {
            Value::ServerError(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    /// Returns the aggregate items when the value is an array or a set.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Recursively converts binary strings into UTF-8 strings, replacing
    /// invalid sequences. Applied to replies when the client is configured
    /// for string mode rather than raw-bytes mode.
    pub fn coerce_strings(self) -> Value {
        match self {
            Value::BulkString(bytes) => {
                Value::SimpleString(String::from_utf8_lossy(&bytes).into_owned())
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::coerce_strings).collect())
            }
            Value::Set(items) => {
                Value::Set(items.into_iter().map(Value::coerce_strings).collect())
            }
            Value::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.coerce_strings(), v.coerce_strings()))
                    .collect(),
            ),
            Value::Push { kind, data } => Value::Push {
                kind,
                data: data.into_iter().map(Value::coerce_strings).collect(),
            },
            other => other,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(val) => write!(f, "int({val:?})"),
            Value::BulkString(values) => match from_utf8(values) {
                Ok(x) => write!(f, "bulk-string('{x:?}')"),
                Err(_) => write!(f, "binary-data({values:?})"),
            },
            Value::Array(values) => write!(f, "array({values:?})"),
            Value::SimpleString(val) => write!(f, "simple-string({val:?})"),
            Value::Okay => write!(f, "ok"),
            Value::Map(values) => write!(f, "map({values:?})"),
            Value::Set(values) => write!(f, "set({values:?})"),
            Value::Double(val) => write!(f, "double({val:?})"),
            Value::Boolean(val) => write!(f, "boolean({val:?})"),
            Value::VerbatimString { format, text } => {
                write!(f, "verbatim-string({format:?}, {text:?})")
            }
            Value::BigNumber(val) => write!(f, "big-number({val:?})"),
            Value::Push { kind, data } => write!(f, "push({kind:?}, {data:?})"),
            Value::ServerError(err) => write!(f, "server-error({}, {:?})", err.code, err.detail),
        }
    }
}

/// Trait for argument types that can be written onto the wire.
pub trait ToArgs {
    /// Appends this value as one or more arguments.
    fn write_args(&self, out: &mut Vec<Vec<u8>>);
}

impl ToArgs for &str {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

impl ToArgs for String {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

impl ToArgs for &[u8] {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.to_vec());
    }
}

impl ToArgs for Vec<u8> {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.clone());
    }
}

impl<const N: usize> ToArgs for &[u8; N] {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.to_vec());
    }
}

impl ToArgs for bool {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(if *self { b"1".to_vec() } else { b"0".to_vec() });
    }
}

macro_rules! itoa_to_args {
    ($($t:ty),*) => {
        $(
            impl ToArgs for $t {
                fn write_args(&self, out: &mut Vec<Vec<u8>>) {
                    let mut buf = ::itoa::Buffer::new();
                    out.push(buf.format(*self).as_bytes().to_vec());
                }
            }
        )*
    };
}

// u8 is left out so that byte slices and byte vectors keep their dedicated
// binary-safe impls
itoa_to_args!(i8, i16, i32, i64, isize, u16, u32, u64, usize);

macro_rules! ryu_to_args {
    ($($t:ty),*) => {
        $(
            impl ToArgs for $t {
                fn write_args(&self, out: &mut Vec<Vec<u8>>) {
                    let mut buf = ::ryu::Buffer::new();
                    out.push(buf.format(*self).as_bytes().to_vec());
                }
            }
        )*
    };
}

ryu_to_args!(f32, f64);

impl<T: ToArgs> ToArgs for &[T] {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        for item in *self {
            item.write_args(out);
        }
    }
}

impl<T: ToArgs> ToArgs for Vec<T> {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        for item in self {
            item.write_args(out);
        }
    }
}

impl<T: ToArgs> ToArgs for Option<T> {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        if let Some(item) = self {
            item.write_args(out);
        }
    }
}

/// Trait for converting a reply [`Value`] into a caller-facing type.
pub trait FromValue: Sized {
    /// Performs the conversion.
    fn from_value(v: Value) -> RedioxResult<Self>;
}

/// Shorthand for [`FromValue::from_value`].
pub fn from_value<T: FromValue>(v: Value) -> RedioxResult<T> {
    T::from_value(v)
}

impl FromValue for Value {
    fn from_value(v: Value) -> RedioxResult<Value> {
        Ok(v)
    }
}

impl FromValue for () {
    fn from_value(v: Value) -> RedioxResult<()> {
        match v {
            Value::ServerError(err) => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl FromValue for String {
    fn from_value(v: Value) -> RedioxResult<String> {
        match v {
            Value::Okay => Ok("OK".to_string()),
            Value::SimpleString(s) => Ok(s),
            Value::BulkString(bytes) => Ok(String::from_utf8(bytes)?),
            Value::VerbatimString { text, .. } => Ok(text),
            Value::Int(n) => Ok(n.to_string()),
            Value::Double(d) => Ok(d.to_string()),
            v => invalid_type_error!(v, "expected a string"),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(v: Value) -> RedioxResult<Vec<u8>> {
        match v {
            Value::BulkString(bytes) => Ok(bytes),
            Value::SimpleString(s) => Ok(s.into_bytes()),
            Value::VerbatimString { text, .. } => Ok(text.into_bytes()),
            v => invalid_type_error!(v, "expected binary data"),
        }
    }
}

impl FromValue for i64 {
    fn from_value(v: Value) -> RedioxResult<i64> {
        match v {
            Value::Int(n) => Ok(n),
            Value::BulkString(ref bytes) => match from_utf8(bytes)?.parse() {
                Ok(n) => Ok(n),
                Err(_) => invalid_type_error!(v, "expected an integer"),
            },
            Value::SimpleString(ref s) => match s.parse() {
                Ok(n) => Ok(n),
                Err(_) => invalid_type_error!(v, "expected an integer"),
            },
            v => invalid_type_error!(v, "expected an integer"),
        }
    }
}

macro_rules! from_value_via_i64 {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(v: Value) -> RedioxResult<$t> {
                    let n = i64::from_value(v)?;
                    match <$t>::try_from(n) {
                        Ok(n) => Ok(n),
                        Err(_) => fail!((
                            ErrorKind::TypeError,
                            "Integer reply out of range for target type"
                        )),
                    }
                }
            }
        )*
    };
}

from_value_via_i64!(i32, u32, u64, usize, u16, i16, u8, i8);

impl FromValue for f64 {
    fn from_value(v: Value) -> RedioxResult<f64> {
        match v {
            Value::Double(d) => Ok(d),
            Value::Int(n) => Ok(n as f64),
            Value::BulkString(ref bytes) => match from_utf8(bytes)?.parse() {
                Ok(d) => Ok(d),
                Err(_) => invalid_type_error!(v, "expected a double"),
            },
            Value::SimpleString(ref s) => match s.parse() {
                Ok(d) => Ok(d),
                Err(_) => invalid_type_error!(v, "expected a double"),
            },
            v => invalid_type_error!(v, "expected a double"),
        }
    }
}

impl FromValue for bool {
    fn from_value(v: Value) -> RedioxResult<bool> {
        match v {
            Value::Boolean(b) => Ok(b),
            Value::Nil => Ok(false),
            Value::Okay => Ok(true),
            Value::Int(n) => Ok(n != 0),
            Value::SimpleString(ref s) if s == "OK" => Ok(true),
            v => invalid_type_error!(v, "expected a boolean"),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(v: Value) -> RedioxResult<Option<T>> {
        match v {
            Value::Nil => Ok(None),
            v => Ok(Some(T::from_value(v)?)),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(v: Value) -> RedioxResult<Vec<T>> {
        match v {
            Value::Nil => Ok(vec![]),
            Value::Array(items) | Value::Set(items) => {
                items.into_iter().map(T::from_value).collect()
            }
            v => invalid_type_error!(v, "expected an array"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_strings_converts_nested_buffers() {
        let value = Value::Array(vec![
            Value::BulkString(b"abc".to_vec()),
            Value::Int(5),
            Value::SimpleString("b".into()),
            Value::Array(vec![Value::Array(vec![
                Value::BulkString(b"abc".to_vec()),
                Value::Int(4),
            ])]),
        ]);
        assert_eq!(
            value.coerce_strings(),
            Value::Array(vec![
                Value::SimpleString("abc".into()),
                Value::Int(5),
                Value::SimpleString("b".into()),
                Value::Array(vec![Value::Array(vec![
                    Value::SimpleString("abc".into()),
                    Value::Int(4),
                ])]),
            ])
        );
    }

    #[test]
    fn coerce_strings_replaces_invalid_utf8() {
        let value = Value::BulkString(vec![0xff, 0xfe]);
        match value.coerce_strings() {
            Value::SimpleString(s) => assert_eq!(s, "\u{fffd}\u{fffd}"),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn extract_error_surfaces_top_level_errors() {
        let err = Value::ServerError(ServerError {
            code: "ERR".into(),
            detail: "boom".into(),
        });
        assert!(err.extract_error().is_err());
        assert_eq!(Value::Okay.extract_error().unwrap(), Value::Okay);
    }

    #[test]
    fn conversions() {
        assert_eq!(from_value::<String>(Value::Okay).unwrap(), "OK");
        assert_eq!(
            from_value::<String>(Value::BulkString(b"hi".to_vec())).unwrap(),
            "hi"
        );
        assert_eq!(from_value::<i64>(Value::BulkString(b"42".to_vec())).unwrap(), 42);
        assert_eq!(from_value::<Option<i64>>(Value::Nil).unwrap(), None);
        assert_eq!(
            from_value::<Vec<i64>>(Value::Array(vec![Value::Int(1), Value::Int(2)])).unwrap(),
            vec![1, 2]
        );
        assert!(from_value::<i64>(Value::Okay).is_err());
        assert!(from_value::<u8>(Value::Int(300)).is_err());
    }

    #[test]
    fn to_args_formats_numbers() {
        let mut out = Vec::new();
        42i64.write_args(&mut out);
        2.5f64.write_args(&mut out);
        "x".write_args(&mut out);
        assert_eq!(out, vec![b"42".to_vec(), b"2.5".to_vec(), b"x".to_vec()]);
    }
}
