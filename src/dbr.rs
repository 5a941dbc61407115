//! Represent the DBR values that monitors deliver.
//!
//! CA transfers data as [DBR] structures: one of seven basic array types, with a
//! category of metadata attached. Only the parts a cache needs are modelled here; the
//! wire encoding of these belongs to whichever client library sits behind a
//! [`SubscriptionSource`](crate::sources::SubscriptionSource).
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. All numeric data types in CA are signed and can represent arrays:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), the index of an enumerated state.
//! - [`DbrValue::String`] ([`Vec<String>`]), natively a `[u8; 40]` per element.
//!
//! The metadata categories carried by [`Dbr`] are:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of [`Dbr::Status`], plus the timestamp of the value.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use num::{NumCast, cast::AsPrimitive};
use std::{convert::TryFrom, fmt, time::SystemTime};
use thiserror::Error;

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Failure to represent a value as another basic type
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Value cannot be represented as the requested type")]
    NoConvert,
    #[error("Conversion between these types is not supported")]
    Unsupported,
}

/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug)]
pub enum DbrParseError {
    SelfIsNotString,
    CannotParse(String),
}

/// Cast every element of a numeric slice, failing if any element doesn't fit
fn cast_all<T, U>(from: &[T]) -> Result<Vec<U>, ConvertError>
where
    T: Copy + NumCast,
    U: NumCast,
{
    from.iter()
        .map(|n| NumCast::from(*n).ok_or(ConvertError::NoConvert))
        .collect()
}

/// Encode a single-item string as a numeric array of its bytes
fn encode_string<T>(from: &[String]) -> Result<Vec<T>, ConvertError>
where
    T: Copy + 'static,
    u8: AsPrimitive<T>,
{
    match from {
        [] => Ok(Vec::new()),
        [val] => Ok(val.as_bytes().iter().map(|c| c.as_()).collect()),
        _ => Err(ConvertError::NoConvert),
    }
}

/// Convert any value into the numeric variant given
macro_rules! cast_into {
    ($value:expr, $variant:ident) => {
        match $value {
            DbrValue::Char(v) => DbrValue::$variant(cast_all(v)?),
            DbrValue::Int(v) => DbrValue::$variant(cast_all(v)?),
            DbrValue::Long(v) => DbrValue::$variant(cast_all(v)?),
            DbrValue::Float(v) => DbrValue::$variant(cast_all(v)?),
            DbrValue::Double(v) => DbrValue::$variant(cast_all(v)?),
            DbrValue::Enum(v) => DbrValue::$variant(cast_all(&[*v])?),
            DbrValue::String(v) => DbrValue::$variant(encode_string(v)?),
        }
    };
}

macro_rules! parse_all {
    ($strings:expr, $variant:ident) => {
        DbrValue::$variant(
            $strings
                .iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect::<Result<Vec<_>, DbrParseError>>()?,
        )
    };
}

impl DbrValue {
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::String => self.clone(),
            DbrBasicType::Enum => match val.as_slice() {
                [s] => DbrValue::Enum(
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))?,
                ),
                _ => return Err(DbrParseError::CannotParse(val.join(" "))),
            },
            DbrBasicType::Char => parse_all!(val, Char),
            DbrBasicType::Int => parse_all!(val, Int),
            DbrBasicType::Long => parse_all!(val, Long),
            DbrBasicType::Float => parse_all!(val, Float),
            DbrBasicType::Double => parse_all!(val, Double),
        })
    }

    /// Represent this value as another basic type.
    ///
    /// Numeric conversions succeed only when every element is representable in the
    /// target type. Strings convert to numeric types by their bytes, and a `Char`
    /// array converts back to a string.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ConvertError> {
        if self.get_type() == basic_type {
            return Ok(self.clone());
        }
        Ok(match basic_type {
            DbrBasicType::Char => cast_into!(self, Char),
            DbrBasicType::Int => cast_into!(self, Int),
            DbrBasicType::Long => cast_into!(self, Long),
            DbrBasicType::Float => cast_into!(self, Float),
            DbrBasicType::Double => cast_into!(self, Double),
            DbrBasicType::String => match self {
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(val.iter().map(|c| *c as u8).collect())
                        .map_err(|_| ConvertError::NoConvert)?,
                ]),
                _ => return Err(ConvertError::Unsupported),
            },
            DbrBasicType::Enum => return Err(ConvertError::NoConvert),
        })
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }
}

fn join_display<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for DbrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbrValue::Enum(x) => write!(f, "{x}"),
            DbrValue::String(v) => join_display(f, v),
            DbrValue::Char(v) => join_display(f, v),
            DbrValue::Int(v) => join_display(f, v),
            DbrValue::Long(v) => join_display(f, v),
            DbrValue::Float(v) => join_display(f, v),
            DbrValue::Double(v) => join_display(f, v),
        }
    }
}

/// Implement conversions between a native type and a specific DbrValue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ConvertError;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => unreachable!(),
                }
            }
        }
        impl TryFrom<DbrValue> for Vec<$typ> {
            type Error = ConvertError;
            fn try_from(value: DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(&value)
            }
        }
        /// Takes the first element; an empty array has no scalar value
        impl TryFrom<DbrValue> for $typ {
            type Error = ConvertError;
            fn try_from(value: DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(&value)?
                    .into_iter()
                    .next()
                    .ok_or(ConvertError::NoConvert)
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

/// Marks a type as being convertible to a DBRValue representation
pub trait IntoDbrBasicType {
    fn get_dbr_basic_type() -> DbrBasicType;
}

macro_rules! impl_into_dbr_basic_type {
    ($t:ty, $variant:ident) => {
        impl IntoDbrBasicType for $t {
            fn get_dbr_basic_type() -> DbrBasicType {
                DbrBasicType::$variant
            }
        }
    };
}

impl_into_dbr_basic_type!(i8, Char);
impl_into_dbr_basic_type!(i16, Int);
impl_into_dbr_basic_type!(i32, Long);
impl_into_dbr_basic_type!(f32, Float);
impl_into_dbr_basic_type!(f64, Double);
impl_into_dbr_basic_type!(String, String);

/// Categories of metadata that can accompany a value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    #[default]
    Time = 2,
}

/// A basic type combined with a metadata category, e.g. `DBR_TIME_DOUBLE`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// A value with its attached metadata, as delivered by a monitor or a read
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
        }
    }
    pub fn value_mut(&mut self) -> &mut DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    /// Convert to another type and category.
    ///
    /// Metadata that the source doesn't carry is filled in: a default (no alarm)
    /// status, and the current time as timestamp.
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ConvertError> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(SystemTime::now),
                value,
            },
        })
    }
}
