//! Fixed-width tuple values.
//!
//! Every table stores values of one fixed size, so a schema is a list of
//! fixed-width fields laid out back to back in little-endian order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pasha_common::{PashaError, Result};
use serde::{Deserialize, Serialize};

/// Column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    U32,
    U64,
    I64,
    F64,
    /// UTF-8 text zero-padded to the given byte width.
    FixedStr(u16),
}

impl FieldType {
    pub fn width(self) -> usize {
        match self {
            FieldType::U32 => 4,
            FieldType::U64 | FieldType::I64 | FieldType::F64 => 8,
            FieldType::FixedStr(n) => n as usize,
        }
    }

    fn name(self) -> String {
        match self {
            FieldType::FixedStr(n) => format!("FixedStr({n})"),
            other => format!("{other:?}"),
        }
    }
}

/// Column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    U32(u32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
}

impl FieldValue {
    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::U32(_) => "U32",
            FieldValue::U64(_) => "U64",
            FieldValue::I64(_) => "I64",
            FieldValue::F64(_) => "F64",
            FieldValue::Str(_) => "Str",
        }
    }
}

/// Ordered list of column types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleSchema {
    fields: Vec<FieldType>,
}

impl TupleSchema {
    pub fn new(fields: Vec<FieldType>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldType] {
        &self.fields
    }

    /// Serialized size of every value of this schema.
    pub fn value_size(&self) -> usize {
        self.fields.iter().map(|f| f.width()).sum()
    }

    /// Byte offset of column `idx`.
    pub fn offset_of(&self, idx: usize) -> usize {
        self.fields[..idx].iter().map(|f| f.width()).sum()
    }
}

/// One row's column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleValue(pub Vec<FieldValue>);

impl TupleValue {
    pub fn serialize(&self, schema: &TupleSchema) -> Result<Bytes> {
        if self.0.len() != schema.fields.len() {
            return Err(PashaError::TupleCorrupted(format!(
                "{} values for a {}-column schema",
                self.0.len(),
                schema.fields.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(schema.value_size());
        for (ty, value) in schema.fields.iter().zip(&self.0) {
            match (ty, value) {
                (FieldType::U32, FieldValue::U32(v)) => buf.put_u32_le(*v),
                (FieldType::U64, FieldValue::U64(v)) => buf.put_u64_le(*v),
                (FieldType::I64, FieldValue::I64(v)) => buf.put_i64_le(*v),
                (FieldType::F64, FieldValue::F64(v)) => buf.put_f64_le(*v),
                (FieldType::FixedStr(n), FieldValue::Str(s)) => {
                    let width = *n as usize;
                    if s.len() > width {
                        return Err(PashaError::ValueSizeMismatch {
                            expected: width,
                            actual: s.len(),
                        });
                    }
                    buf.put_slice(s.as_bytes());
                    buf.put_bytes(0, width - s.len());
                }
                (ty, value) => {
                    return Err(PashaError::TypeMismatch {
                        expected: ty.name(),
                        actual: value.type_name().to_string(),
                    })
                }
            }
        }
        Ok(buf.freeze())
    }

    pub fn deserialize(schema: &TupleSchema, mut data: &[u8]) -> Result<Self> {
        if data.len() != schema.value_size() {
            return Err(PashaError::ValueSizeMismatch {
                expected: schema.value_size(),
                actual: data.len(),
            });
        }
        let mut values = Vec::with_capacity(schema.fields.len());
        for ty in &schema.fields {
            let v = match ty {
                FieldType::U32 => FieldValue::U32(data.get_u32_le()),
                FieldType::U64 => FieldValue::U64(data.get_u64_le()),
                FieldType::I64 => FieldValue::I64(data.get_i64_le()),
                FieldType::F64 => FieldValue::F64(data.get_f64_le()),
                FieldType::FixedStr(n) => {
                    let raw = &data[..*n as usize];
                    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                    let s = std::str::from_utf8(&raw[..end])
                        .map_err(|e| PashaError::TupleCorrupted(format!("text column: {e}")))?;
                    let v = FieldValue::Str(s.to_string());
                    data.advance(*n as usize);
                    v
                }
            };
            values.push(v);
        }
        Ok(TupleValue(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_schema() -> TupleSchema {
        TupleSchema::new(vec![
            FieldType::U64,
            FieldType::FixedStr(16),
            FieldType::F64,
            FieldType::I64,
            FieldType::U32,
        ])
    }

    #[test]
    fn test_layout() {
        let s = account_schema();
        assert_eq!(s.value_size(), 8 + 16 + 8 + 8 + 4);
        assert_eq!(s.offset_of(2), 24);
    }

    #[test]
    fn test_roundtrip() {
        let s = account_schema();
        let v = TupleValue(vec![
            FieldValue::U64(77),
            FieldValue::Str("savings".into()),
            FieldValue::F64(1250.5),
            FieldValue::I64(-3),
            FieldValue::U32(9),
        ]);
        let bytes = v.serialize(&s).unwrap();
        assert_eq!(bytes.len(), s.value_size());
        assert_eq!(TupleValue::deserialize(&s, &bytes).unwrap(), v);
    }

    #[test]
    fn test_type_mismatch() {
        let s = TupleSchema::new(vec![FieldType::U32]);
        let err = TupleValue(vec![FieldValue::Str("x".into())]).serialize(&s).unwrap_err();
        assert_eq!(err.to_string(), "Type mismatch: expected U32, got Str");
    }

    #[test]
    fn test_string_too_long() {
        let s = TupleSchema::new(vec![FieldType::FixedStr(3)]);
        assert!(matches!(
            TupleValue(vec![FieldValue::Str("abcd".into())]).serialize(&s),
            Err(PashaError::ValueSizeMismatch { expected: 3, actual: 4 })
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let s = account_schema();
        assert!(TupleValue::deserialize(&s, &[0u8; 10]).is_err());
    }
}
