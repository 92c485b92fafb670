//! Tag catalog and register decoding.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fieldlink_common::TagValue;
use fieldlink_common::config::bounded_int;

/// Errors raised when a catalog is built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("At least one tag must be configured")]
    Empty,
    #[error("Tag name cannot be empty (source '{source_name}')")]
    EmptyName { source_name: String },
    #[error("Duplicate tag name '{0}'")]
    Duplicate(String),
    #[error("Tag '{0}': name cannot contain MQTT wildcards")]
    InvalidName(String),
    #[error("Tag '{tag}': {value_type} needs {expected:?} register(s), got quantity {quantity}")]
    Quantity {
        tag: String,
        value_type: ValueType,
        expected: RangeInclusive<u16>,
        quantity: u16,
    },
    #[error("Tag '{tag}': registers {address}+{quantity} exceed the address space")]
    AddressOverflow {
        tag: String,
        address: u16,
        quantity: u16,
    },
}

/// Errors raised when register bytes cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("device returned no data")]
    Empty,
    #[error("{0} bytes returned, at most 4 fit a 32-bit value")]
    TooLong(usize),
    #[error("{value_type} needs {expected} bytes, got {actual}")]
    Length {
        value_type: ValueType,
        expected: usize,
        actual: usize,
    },
    #[error("float32 registers hold a non-finite value ({0:#010x})")]
    NonFinite(u32),
}

/// Modbus register table a tag is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Input registers (read-only, function code 4).
    #[default]
    Input,
    /// Holding registers (read/write, function code 3).
    Holding,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Input => "input",
            RegisterKind::Holding => "holding",
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a tag's register bytes are interpreted.
///
/// Registers are concatenated big-endian before decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Unsigned 32-bit integer from 1 or 2 registers. Fewer than 4 bytes are
    /// right-aligned in a zeroed 4-byte buffer.
    #[default]
    #[serde(alias = "u32", alias = "int", alias = "uint")]
    Uint32,
    /// Signed 32-bit integer (2 registers).
    #[serde(alias = "i32")]
    Int32,
    /// Unsigned 16-bit integer (1 register).
    #[serde(alias = "u16")]
    Uint16,
    /// Signed 16-bit integer (1 register).
    #[serde(alias = "i16")]
    Int16,
    /// IEEE-754 single precision float (2 registers).
    #[serde(alias = "f32", alias = "float")]
    Float32,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Uint32 => "uint32",
            ValueType::Int32 => "int32",
            ValueType::Uint16 => "uint16",
            ValueType::Int16 => "int16",
            ValueType::Float32 => "float32",
        }
    }

    /// Register counts this type can be read from.
    pub fn register_range(&self) -> RangeInclusive<u16> {
        match self {
            ValueType::Uint32 => 1..=2,
            ValueType::Int32 | ValueType::Float32 => 2..=2,
            ValueType::Uint16 | ValueType::Int16 => 1..=1,
        }
    }

    /// Decode register bytes into a value.
    ///
    /// ```
    /// use mqtt_bridge_modbus::catalog::ValueType;
    /// use fieldlink_common::TagValue;
    ///
    /// assert_eq!(ValueType::Uint32.decode(&[0x00, 0x01]), Ok(TagValue::Integer(1)));
    /// ```
    pub fn decode(&self, bytes: &[u8]) -> Result<TagValue, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        match self {
            ValueType::Uint32 => {
                if bytes.len() > 4 {
                    return Err(DecodeError::TooLong(bytes.len()));
                }
                let mut buf = [0u8; 4];
                buf[4 - bytes.len()..].copy_from_slice(bytes);
                Ok(TagValue::from(u32::from_be_bytes(buf)))
            }
            ValueType::Int32 => {
                let buf: [u8; 4] = self.exact(bytes)?;
                Ok(TagValue::Integer(i64::from(i32::from_be_bytes(buf))))
            }
            ValueType::Uint16 => {
                let buf: [u8; 2] = self.exact(bytes)?;
                Ok(TagValue::Integer(i64::from(u16::from_be_bytes(buf))))
            }
            ValueType::Int16 => {
                let buf: [u8; 2] = self.exact(bytes)?;
                Ok(TagValue::Integer(i64::from(i16::from_be_bytes(buf))))
            }
            ValueType::Float32 => {
                let buf: [u8; 4] = self.exact(bytes)?;
                let value = f32::from_be_bytes(buf);
                if !value.is_finite() {
                    return Err(DecodeError::NonFinite(u32::from_be_bytes(buf)));
                }
                Ok(TagValue::from(value))
            }
        }
    }

    fn exact<const N: usize>(&self, bytes: &[u8]) -> Result<[u8; N], DecodeError> {
        bytes.try_into().map_err(|_| DecodeError::Length {
            value_type: *self,
            expected: N,
            actual: bytes.len(),
        })
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named measurement point on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Device or subsystem the value belongs to.
    #[serde(alias = "srcNmae", alias = "sourceName")]
    pub source_name: String,

    /// Tag name, unique within the catalog.
    #[serde(alias = "tagNmae", alias = "tagName")]
    pub tag_name: String,

    #[serde(default, alias = "valueType")]
    pub value_type: ValueType,

    /// First register address (0-based).
    #[serde(alias = "addr", deserialize_with = "bounded_int")]
    pub address: u16,

    /// Number of 16-bit registers to read.
    #[serde(default = "default_quantity", alias = "qty", deserialize_with = "bounded_int")]
    pub quantity: u16,

    #[serde(default, alias = "registerKind")]
    pub register_kind: RegisterKind,
}

fn default_quantity() -> u16 {
    2
}

impl Tag {
    /// Decode this tag's register bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<TagValue, DecodeError> {
        self.value_type.decode(bytes)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.tag_name.trim().is_empty() {
            return Err(CatalogError::EmptyName {
                source_name: self.source_name.clone(),
            });
        }
        if self.tag_name.contains(['+', '#']) {
            return Err(CatalogError::InvalidName(self.tag_name.clone()));
        }

        let expected = self.value_type.register_range();
        if !expected.contains(&self.quantity) {
            return Err(CatalogError::Quantity {
                tag: self.tag_name.clone(),
                value_type: self.value_type,
                expected,
                quantity: self.quantity,
            });
        }
        if u32::from(self.address) + u32::from(self.quantity) > 0x1_0000 {
            return Err(CatalogError::AddressOverflow {
                tag: self.tag_name.clone(),
                address: self.address,
                quantity: self.quantity,
            });
        }

        Ok(())
    }
}

/// Ordered, validated list of tags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<Tag>")]
pub struct TagCatalog {
    tags: Vec<Tag>,
}

impl TagCatalog {
    /// Build a catalog, checking names, quantities and address ranges.
    pub fn new(tags: Vec<Tag>) -> Result<Self, CatalogError> {
        if tags.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        for tag in &tags {
            tag.validate()?;
            if !seen.insert(tag.tag_name.as_str()) {
                return Err(CatalogError::Duplicate(tag.tag_name.clone()));
            }
        }

        Ok(Self { tags })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl TryFrom<Vec<Tag>> for TagCatalog {
    type Error = CatalogError;

    fn try_from(tags: Vec<Tag>) -> Result<Self, Self::Error> {
        Self::new(tags)
    }
}

impl<'a> IntoIterator for &'a TagCatalog {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

/// Concatenate registers big-endian.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}
