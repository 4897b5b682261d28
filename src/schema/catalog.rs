//! 已编目记录类型的字段表
//!
//! 只收录头部和少量示例类型；其余类型使用 `GENERIC`，
//! 除 EDID 外的数据块按原样保留。

use super::{Codec, CountLayout, CountWidth, FieldEntry, Primitive, RecordSchema};
use crate::datatypes::Signature;

use Primitive::*;

/// MODL 模型子对象
pub static MODEL: &[FieldEntry] = &[
    FieldEntry::required(b"MODL", Codec::ZString),
    FieldEntry::optional(b"MODT", Codec::Bytes),
    FieldEntry::optional(b"MODS", Codec::Bytes),
];

/// MAST/DATA 主文件条目
pub static MASTER: &[FieldEntry] = &[
    FieldEntry::required(b"MAST", Codec::ZString),
    FieldEntry::required(b"DATA", Codec::Struct(&[U64])),
];

pub static TES4: RecordSchema = RecordSchema {
    signature: Signature(*b"TES4"),
    entries: &[
        // version, record count, next object id
        FieldEntry::required(b"HEDR", Codec::Struct(&[F32, U32, U32])),
        FieldEntry::optional(b"CNAM", Codec::ZString),
        FieldEntry::optional(b"SNAM", Codec::ZString),
        FieldEntry::repeated(b"MAST", Codec::Object(MASTER)),
        FieldEntry::optional(b"ONAM", Codec::Bytes),
        FieldEntry::optional(b"INTV", Codec::Struct(&[U32])),
        FieldEntry::optional(b"INCC", Codec::Struct(&[U32])),
    ],
};

pub static KEYM: RecordSchema = RecordSchema {
    signature: Signature(*b"KEYM"),
    entries: &[
        FieldEntry::optional(b"EDID", Codec::ZString),
        FieldEntry::optional(b"VMAD", Codec::Bytes),
        // x1 y1 z1 x2 y2 z2
        FieldEntry::required(b"OBND", Codec::Struct(&[I16, I16, I16, I16, I16, I16])),
        FieldEntry::optional(b"FULL", Codec::LString),
        FieldEntry::optional(b"MODL", Codec::Object(MODEL)),
        FieldEntry::optional(b"YNAM", Codec::Struct(&[FormId])),
        FieldEntry::optional(b"ZNAM", Codec::Struct(&[FormId])),
        FieldEntry::counted(b"KSIZ", CountWidth::U32, CountLayout::Packed, b"KWDA", Codec::PackedArray(FormId)),
        // value, weight
        FieldEntry::optional(b"DATA", Codec::Struct(&[U32, F32])),
    ],
};

pub static KYWD: RecordSchema = RecordSchema {
    signature: Signature(*b"KYWD"),
    entries: &[
        FieldEntry::optional(b"EDID", Codec::ZString),
        // r g b unused
        FieldEntry::optional(b"CNAM", Codec::Struct(&[U8, U8, U8, U8])),
    ],
};

pub static GLOB: RecordSchema = RecordSchema {
    signature: Signature(*b"GLOB"),
    entries: &[
        FieldEntry::optional(b"EDID", Codec::ZString),
        FieldEntry::required(b"FNAM", Codec::Struct(&[U8])),
        FieldEntry::required(b"FLTV", Codec::Struct(&[F32])),
    ],
};

pub static GENERIC: RecordSchema = RecordSchema {
    signature: Signature(*b"____"),
    entries: &[FieldEntry::optional(b"EDID", Codec::ZString)],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Cardinality;

    fn check_unique(entries: &[FieldEntry]) {
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                assert_ne!(a.lead_signature(), b.lead_signature(), "签名重复: {}", a.signature);
            }
            if let Codec::Object(sub) = a.codec {
                assert_eq!(sub[0].signature, a.signature, "子对象首项必须与条目签名一致");
                check_unique(sub);
            }
        }
    }

    #[test]
    fn test_catalog_signatures_unique() {
        for schema in [&TES4, &KEYM, &KYWD, &GLOB, &GENERIC] {
            check_unique(schema.entries);
        }
    }

    #[test]
    fn test_keym_layout() {
        assert_eq!(KEYM.entries[2].codec.fixed_size(), Some(12));
        assert!(matches!(
            KEYM.entries[7].cardinality,
            Cardinality::Counted { layout: CountLayout::Packed, .. }
        ));
        assert_eq!(KEYM.entry_index(Signature(*b"DATA")), Some(8));
    }
}
