// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The `Constant` value type and its marshal-style byte serialization.

The on-disk format is loosely modeled on CPython's `marshal` module (type
tag byte followed by a type-specific payload) but is not byte-for-byte
compatible with it: the consuming C runtime is out of scope for this
crate, so the only requirement is that our own reader can reconstruct
exactly what our own writer produced.
*/

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt::Write as _;
use std::io::{Cursor, Read, Write};

/// A Python literal value as represented on the Rust side of the
/// code-object/constant-pool boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    /// Integer magnitude too large for `i64`, kept as a decimal string.
    BigInt(String),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Constant>),
    /// A nested code object, referenced by the index it was registered
    /// under in the owning module's code-object table.
    CodeRef(u32),
}

const TAG_NONE: u8 = 0;
const TAG_BOOL_FALSE: u8 = 1;
const TAG_BOOL_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_BIGINT: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_TUPLE: u8 = 8;
const TAG_CODEREF: u8 = 9;

impl Constant {
    /// Serialize a tuple of constants into a marshal-style byte blob.
    pub fn serialize_tuple(values: &[Constant]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(values.len() as u32)?;
        for value in values {
            value.write(&mut out)?;
        }
        Ok(out)
    }

    /// Deserialize a blob produced by `serialize_tuple`.
    pub fn deserialize_tuple(blob: &[u8]) -> Result<Vec<Constant>> {
        let mut cursor = Cursor::new(blob);
        let count = cursor
            .read_u32::<LittleEndian>()
            .context("reading constant tuple length")?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(Constant::read(&mut cursor)?);
        }
        Ok(values)
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Constant::None => out.write_u8(TAG_NONE)?,
            Constant::Bool(false) => out.write_u8(TAG_BOOL_FALSE)?,
            Constant::Bool(true) => out.write_u8(TAG_BOOL_TRUE)?,
            Constant::Int(v) => {
                out.write_u8(TAG_INT)?;
                out.write_i64::<LittleEndian>(*v)?;
            }
            Constant::BigInt(digits) => {
                out.write_u8(TAG_BIGINT)?;
                let bytes = digits.as_bytes();
                out.write_u32::<LittleEndian>(bytes.len() as u32)?;
                out.extend_from_slice(bytes);
            }
            Constant::Float(v) => {
                out.write_u8(TAG_FLOAT)?;
                out.write_f64::<LittleEndian>(*v)?;
            }
            Constant::Str(s) => {
                out.write_u8(TAG_STR)?;
                let bytes = s.as_bytes();
                out.write_u32::<LittleEndian>(bytes.len() as u32)?;
                out.extend_from_slice(bytes);
            }
            Constant::Bytes(b) => {
                out.write_u8(TAG_BYTES)?;
                out.write_u32::<LittleEndian>(b.len() as u32)?;
                out.extend_from_slice(b);
            }
            Constant::Tuple(items) => {
                out.write_u8(TAG_TUPLE)?;
                out.write_u32::<LittleEndian>(items.len() as u32)?;
                for item in items {
                    item.write(out)?;
                }
            }
            Constant::CodeRef(idx) => {
                out.write_u8(TAG_CODEREF)?;
                out.write_u32::<LittleEndian>(*idx)?;
            }
        }
        Ok(())
    }

    fn read(cursor: &mut Cursor<&[u8]>) -> Result<Constant> {
        let tag = cursor.read_u8().context("reading constant tag")?;
        Ok(match tag {
            TAG_NONE => Constant::None,
            TAG_BOOL_FALSE => Constant::Bool(false),
            TAG_BOOL_TRUE => Constant::Bool(true),
            TAG_INT => Constant::Int(cursor.read_i64::<LittleEndian>()?),
            TAG_BIGINT => {
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                cursor.read_exact(&mut buf)?;
                Constant::BigInt(String::from_utf8(buf).context("decoding bigint digits")?)
            }
            TAG_FLOAT => Constant::Float(cursor.read_f64::<LittleEndian>()?),
            TAG_STR => {
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                cursor.read_exact(&mut buf)?;
                Constant::Str(String::from_utf8(buf).context("decoding string constant")?)
            }
            TAG_BYTES => {
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                cursor.read_exact(&mut buf)?;
                Constant::Bytes(buf)
            }
            TAG_TUPLE => {
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Constant::read(cursor)?);
                }
                Constant::Tuple(items)
            }
            TAG_CODEREF => Constant::CodeRef(cursor.read_u32::<LittleEndian>()?),
            other => bail!("unrecognized constant tag byte {other}"),
        })
    }

    /// Render as a C byte-array initializer literal, e.g. `{0x01, 0x02}`.
    pub fn blob_to_c_array(blob: &[u8]) -> String {
        let mut s = String::with_capacity(blob.len() * 6 + 2);
        s.push('{');
        for (i, byte) in blob.iter().enumerate() {
            if i > 0 {
                s.push_str(", ");
            }
            write!(&mut s, "0x{byte:02x}").expect("writing to String cannot fail");
        }
        s.push('}');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_scalars() {
        let values = vec![
            Constant::None,
            Constant::Bool(true),
            Constant::Int(-42),
            Constant::Float(3.5),
            Constant::Str("hello".to_string()),
            Constant::Bytes(vec![1, 2, 3]),
        ];
        let blob = Constant::serialize_tuple(&values).unwrap();
        let decoded = Constant::deserialize_tuple(&blob).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn test_roundtrip_nested_tuple() {
        let values = vec![Constant::Tuple(vec![
            Constant::Int(1),
            Constant::Tuple(vec![Constant::Str("x".to_string())]),
        ])];
        let blob = Constant::serialize_tuple(&values).unwrap();
        assert_eq!(Constant::deserialize_tuple(&blob).unwrap(), values);
    }

    #[test]
    fn test_bigint_roundtrip() {
        let values = vec![Constant::BigInt("123456789012345678901234567890".to_string())];
        let blob = Constant::serialize_tuple(&values).unwrap();
        assert_eq!(Constant::deserialize_tuple(&blob).unwrap(), values);
    }

    #[test]
    fn test_index_stability() {
        let values = vec![Constant::Int(1), Constant::Int(2), Constant::Int(3)];
        let blob = Constant::serialize_tuple(&values).unwrap();
        let decoded = Constant::deserialize_tuple(&blob).unwrap();
        for (i, v) in values.iter().enumerate() {
            assert_eq!(&decoded[i], v);
        }
    }

    #[test]
    fn test_blob_to_c_array() {
        assert_eq!(Constant::blob_to_c_array(&[0, 255]), "{0x00, 0xff}");
    }
}


