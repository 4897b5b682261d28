//! 签名与字段编解码器：单个数据块 ↔ 类型化的值

use std::io::Cursor;

use super::engine::{FormIdEncoder, ParseContext, RecordFields};
use super::{Codec, CountWidth, Primitive};
use crate::datatypes::{
    read_f32, read_i16, read_i32, read_i8, read_u16, read_u32, read_u64, read_u8, write_f32,
    write_i16, write_i32, write_i8, write_u16, write_u32, write_u64, write_u8, RawString,
    Signature,
};
use crate::formid::{FormRef, LocalRef};
use crate::subrecord::Subrecord;
use crate::utils::{EspError, Result};

/// 定长结构中的一个值
#[derive(Debug, Clone, Copy)]
pub enum Scalar {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    F32(f32),
    FormId(FormRef),
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        use Scalar::*;
        match (self, other) {
            (U8(a), U8(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            // 按位比较，NaN 与自身相等
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (FormId(a), FormId(b)) => a == b,
            _ => false,
        }
    }
}

impl Scalar {
    pub fn primitive(&self) -> Primitive {
        match self {
            Scalar::U8(_) => Primitive::U8,
            Scalar::I8(_) => Primitive::I8,
            Scalar::U16(_) => Primitive::U16,
            Scalar::I16(_) => Primitive::I16,
            Scalar::U32(_) => Primitive::U32,
            Scalar::I32(_) => Primitive::I32,
            Scalar::U64(_) => Primitive::U64,
            Scalar::F32(_) => Primitive::F32,
            Scalar::FormId(_) => Primitive::FormId,
        }
    }

    pub fn default_for(primitive: Primitive) -> Self {
        match primitive {
            Primitive::U8 => Scalar::U8(0),
            Primitive::I8 => Scalar::I8(0),
            Primitive::U16 => Scalar::U16(0),
            Primitive::I16 => Scalar::I16(0),
            Primitive::U32 => Scalar::U32(0),
            Primitive::I32 => Scalar::I32(0),
            Primitive::U64 => Scalar::U64(0),
            Primitive::F32 => Scalar::F32(0.0),
            Primitive::FormId => Scalar::FormId(FormRef::Local(LocalRef(0))),
        }
    }

    fn read(primitive: Primitive, cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(match primitive {
            Primitive::U8 => Scalar::U8(read_u8(cursor)?),
            Primitive::I8 => Scalar::I8(read_i8(cursor)?),
            Primitive::U16 => Scalar::U16(read_u16(cursor)?),
            Primitive::I16 => Scalar::I16(read_i16(cursor)?),
            Primitive::U32 => Scalar::U32(read_u32(cursor)?),
            Primitive::I32 => Scalar::I32(read_i32(cursor)?),
            Primitive::U64 => Scalar::U64(read_u64(cursor)?),
            Primitive::F32 => Scalar::F32(read_f32(cursor)?),
            Primitive::FormId => Scalar::FormId(FormRef::Local(LocalRef(read_u32(cursor)?))),
        })
    }

    fn write(&self, out: &mut Vec<u8>, encoder: &dyn FormIdEncoder) -> Result<()> {
        match self {
            Scalar::U8(v) => write_u8(out, *v)?,
            Scalar::I8(v) => write_i8(out, *v)?,
            Scalar::U16(v) => write_u16(out, *v)?,
            Scalar::I16(v) => write_i16(out, *v)?,
            Scalar::U32(v) => write_u32(out, *v)?,
            Scalar::I32(v) => write_i32(out, *v)?,
            Scalar::U64(v) => write_u64(out, *v)?,
            Scalar::F32(v) => write_f32(out, *v)?,
            Scalar::FormId(form) => write_u32(out, encoder.encode_form(form)?.0)?,
        }
        Ok(())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Scalar::U8(v) => Some(v as u64),
            Scalar::U16(v) => Some(v as u64),
            Scalar::U32(v) => Some(v as u64),
            Scalar::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&FormRef> {
        match self {
            Scalar::FormId(form) => Some(form),
            _ => None,
        }
    }
}

/// 本地化字符串
#[derive(Debug, Clone, PartialEq)]
pub enum LString {
    /// STRINGS 文件中的字符串 ID
    Id(u32),
    Text(RawString),
}

/// 字段值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Struct(Vec<Scalar>),
    String(RawString),
    LString(LString),
    Array(Vec<Scalar>),
    Bytes(Vec<u8>),
    Object(RecordFields),
    /// 重复 / 计数字段的元素
    List(Vec<FieldValue>),
    /// 结构成员（只在按路径读写时出现）
    Scalar(Scalar),
}

impl FieldValue {
    pub fn string(text: impl Into<String>) -> Self {
        FieldValue::String(RawString::new(text))
    }

    pub fn form_ids(forms: impl IntoIterator<Item = FormRef>) -> Self {
        FieldValue::Array(forms.into_iter().map(Scalar::FormId).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(&s.content),
            FieldValue::LString(LString::Text(s)) => Some(&s.content),
            _ => None,
        }
    }

    pub fn as_scalars(&self) -> Option<&[Scalar]> {
        match self {
            FieldValue::Struct(v) | FieldValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// 数组类字段的元素个数
    pub fn element_count(&self) -> usize {
        match self {
            FieldValue::Array(v) => v.len(),
            FieldValue::List(v) => v.len(),
            FieldValue::Bytes(v) => v.len(),
            _ => 1,
        }
    }
}

/// 编解码器的默认值（必填字段在新建记录时使用）
pub fn default_value(codec: &Codec) -> FieldValue {
    match codec {
        Codec::Struct(members) => {
            FieldValue::Struct(members.iter().map(|p| Scalar::default_for(*p)).collect())
        }
        Codec::ZString => FieldValue::String(RawString::new("")),
        Codec::LString => FieldValue::LString(LString::Text(RawString::new(""))),
        Codec::PackedArray(_) => FieldValue::Array(Vec::new()),
        Codec::Bytes => FieldValue::Bytes(Vec::new()),
        Codec::Object(entries) => FieldValue::Object(RecordFields::with_defaults(*entries)),
    }
}

/// 值是否符合编解码器的布局
pub fn accepts(codec: &Codec, value: &FieldValue) -> bool {
    match (codec, value) {
        (Codec::Struct(members), FieldValue::Struct(scalars)) => {
            members.len() == scalars.len()
                && members.iter().zip(scalars).all(|(p, s)| s.primitive() == *p)
        }
        (Codec::ZString, FieldValue::String(_)) => true,
        (Codec::LString, FieldValue::LString(_)) => true,
        (Codec::PackedArray(p), FieldValue::Array(scalars)) => {
            scalars.iter().all(|s| s.primitive() == *p)
        }
        (Codec::Bytes, FieldValue::Bytes(_)) => true,
        (Codec::Object(entries), FieldValue::Object(fields)) => fields.len() == entries.len(),
        _ => false,
    }
}

/// 解码单个数据块
pub fn decode(codec: &Codec, chunk: &Subrecord, ctx: &ParseContext) -> Result<FieldValue> {
    let signature = chunk.signature;
    let data = &chunk.data[..];

    match codec {
        Codec::Struct(members) => {
            let expected = codec.fixed_size().unwrap_or(0);
            if data.len() != expected {
                return Err(EspError::malformed(
                    signature,
                    format!("expected {} bytes, found {}", expected, data.len()),
                ));
            }
            let mut cursor = Cursor::new(data);
            let scalars = members
                .iter()
                .map(|p| Scalar::read(*p, &mut cursor))
                .collect::<std::io::Result<Vec<_>>>()?;
            Ok(FieldValue::Struct(scalars))
        }
        Codec::ZString => Ok(FieldValue::String(RawString::parse_zstring(data))),
        Codec::LString => {
            if ctx.localized {
                if data.len() != 4 {
                    return Err(EspError::malformed(
                        signature,
                        format!("localized string id must be 4 bytes, found {}", data.len()),
                    ));
                }
                let mut cursor = Cursor::new(data);
                Ok(FieldValue::LString(LString::Id(read_u32(&mut cursor)?)))
            } else {
                Ok(FieldValue::LString(LString::Text(RawString::parse_zstring(data))))
            }
        }
        Codec::PackedArray(primitive) => {
            let size = primitive.size();
            if data.len() % size != 0 {
                return Err(EspError::malformed(
                    signature,
                    format!("{} bytes is not a multiple of element size {}", data.len(), size),
                ));
            }
            let mut cursor = Cursor::new(data);
            let scalars = (0..data.len() / size)
                .map(|_| Scalar::read(*primitive, &mut cursor))
                .collect::<std::io::Result<Vec<_>>>()?;
            Ok(FieldValue::Array(scalars))
        }
        Codec::Bytes => Ok(FieldValue::Bytes(data.to_vec())),
        Codec::Object(_) => Err(EspError::malformed(signature, "sub-object spans several chunks")),
    }
}

/// 编码单个数据块的负载
pub fn encode(
    codec: &Codec,
    signature: Signature,
    value: &FieldValue,
    encoder: &dyn FormIdEncoder,
) -> Result<Vec<u8>> {
    if !accepts(codec, value) {
        return Err(EspError::malformed(signature, "value does not match field layout"));
    }

    let mut out = Vec::new();
    match value {
        FieldValue::Struct(scalars) | FieldValue::Array(scalars) => {
            for scalar in scalars {
                scalar.write(&mut out, encoder)?;
            }
        }
        FieldValue::String(s) => out = s.to_zstring(),
        FieldValue::LString(LString::Id(id)) => write_u32(&mut out, *id)?,
        FieldValue::LString(LString::Text(s)) => out = s.to_zstring(),
        FieldValue::Bytes(bytes) => out.extend_from_slice(bytes),
        FieldValue::Object(_) | FieldValue::List(_) | FieldValue::Scalar(_) => {
            return Err(EspError::malformed(signature, "not a single-chunk value"));
        }
    }
    Ok(out)
}

/// 读取计数字段
pub fn decode_count(width: CountWidth, chunk: &Subrecord) -> Result<usize> {
    let expected = match width {
        CountWidth::U8 => 1,
        CountWidth::U16 => 2,
        CountWidth::U32 => 4,
    };
    if chunk.data.len() != expected {
        return Err(EspError::malformed(
            chunk.signature,
            format!("count must be {} bytes, found {}", expected, chunk.data.len()),
        ));
    }
    let mut cursor = Cursor::new(&chunk.data[..]);
    Ok(match width {
        CountWidth::U8 => read_u8(&mut cursor)? as usize,
        CountWidth::U16 => read_u16(&mut cursor)? as usize,
        CountWidth::U32 => read_u32(&mut cursor)? as usize,
    })
}

pub fn encode_count(width: CountWidth, signature: Signature, count: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let overflow = || EspError::malformed(signature, format!("count {} does not fit", count));
    match width {
        CountWidth::U8 => write_u8(&mut out, u8::try_from(count).map_err(|_| overflow())?)?,
        CountWidth::U16 => write_u16(&mut out, u16::try_from(count).map_err(|_| overflow())?)?,
        CountWidth::U32 => write_u32(&mut out, u32::try_from(count).map_err(|_| overflow())?)?,
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::engine::RawFormIds;

    fn chunk(sig: &[u8; 4], data: &[u8]) -> Subrecord {
        Subrecord::new(Signature(*sig), data.to_vec())
    }

    #[test]
    fn test_struct_size_mismatch_is_malformed() {
        let codec = Codec::Struct(&[Primitive::U32, Primitive::F32]);
        let err = decode(&codec, &chunk(b"DATA", &[1, 0, 0, 0]), &ParseContext::default()).unwrap_err();
        assert!(matches!(err, EspError::MalformedField { .. }));
    }

    #[test]
    fn test_struct_decode() {
        let codec = Codec::Struct(&[Primitive::U32, Primitive::F32]);
        let mut data = 25u32.to_le_bytes().to_vec();
        data.extend_from_slice(&1.5f32.to_le_bytes());
        let value = decode(&codec, &chunk(b"DATA", &data), &ParseContext::default()).unwrap();
        assert_eq!(value, FieldValue::Struct(vec![Scalar::U32(25), Scalar::F32(1.5)]));

        let encoded = encode(&codec, Signature(*b"DATA"), &value, &RawFormIds).unwrap();
        assert_eq!(encoded, data);
    }

    #[test]
    fn test_lstring_depends_on_localized_flag() {
        let data = 0x1234u32.to_le_bytes();
        let localized = ParseContext { localized: true, ..Default::default() };
        let value = decode(&Codec::LString, &chunk(b"FULL", &data), &localized).unwrap();
        assert_eq!(value, FieldValue::LString(LString::Id(0x1234)));

        let value = decode(&Codec::LString, &chunk(b"FULL", b"Key\0"), &ParseContext::default()).unwrap();
        assert_eq!(value.as_str(), Some("Key"));
    }

    #[test]
    fn test_packed_array_alignment() {
        let codec = Codec::PackedArray(Primitive::FormId);
        assert!(decode(&codec, &chunk(b"KWDA", &[0; 6]), &ParseContext::default()).is_err());

        let value = decode(&codec, &chunk(b"KWDA", &[1, 0, 0, 0, 2, 0, 0, 1]), &ParseContext::default()).unwrap();
        assert_eq!(
            value,
            FieldValue::form_ids([FormRef::Local(LocalRef(1)), FormRef::Local(LocalRef(0x0100_0002))])
        );
    }

    #[test]
    fn test_encode_rejects_wrong_layout() {
        let codec = Codec::Struct(&[Primitive::U8]);
        let value = FieldValue::Struct(vec![Scalar::U32(1)]);
        assert!(encode(&codec, Signature(*b"FNAM"), &value, &RawFormIds).is_err());
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(Scalar::F32(f32::NAN), Scalar::F32(f32::NAN));
        assert_ne!(Scalar::F32(0.0), Scalar::F32(-0.0));
    }

    #[test]
    fn test_count_roundtrip_and_overflow() {
        let c = chunk(b"KSIZ", &3u32.to_le_bytes());
        assert_eq!(decode_count(CountWidth::U32, &c).unwrap(), 3);
        assert!(decode_count(CountWidth::U16, &c).is_err());
        assert!(encode_count(CountWidth::U8, Signature(*b"COCT"), 300).is_err());
    }
}
