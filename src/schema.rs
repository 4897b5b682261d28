//! 声明式记录结构
//!
//! 每种记录类型由一张静态的字段表描述（签名、基数、值编解码器），
//! 由同一个通用引擎解释。新增记录类型只需要新增数据。

pub mod catalog;
pub mod codec;
pub mod engine;

use std::fmt;

use serde::Serialize;

use crate::datatypes::Signature;

pub use codec::{FieldValue, LString, Scalar};
pub use engine::{FieldPath, FormIdEncoder, ParseContext, PathSegment, RecordFields, UnknownChunk};

/// 定长结构中的基本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    F32,
    /// 32 位对象引用
    FormId,
}

impl Primitive {
    pub const fn size(self) -> usize {
        match self {
            Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 | Primitive::I16 => 2,
            Primitive::U32 | Primitive::I32 | Primitive::F32 | Primitive::FormId => 4,
            Primitive::U64 => 8,
        }
    }
}

/// 单个数据块的值编解码器
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    /// 定长结构
    Struct(&'static [Primitive]),
    /// null 结尾字符串
    ZString,
    /// 本地化字符串：本地化插件中为 u32 字符串 ID，否则为 ZString
    LString,
    /// 紧凑数组
    PackedArray(Primitive),
    /// 不解释的原始字节
    Bytes,
    /// 由多个连续数据块组成的子对象
    Object(&'static [FieldEntry]),
}

impl Codec {
    /// 定长结构的字节数
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Codec::Struct(members) => Some(members.iter().map(|p| p.size()).sum()),
            _ => None,
        }
    }
}

/// 计数字段宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountWidth {
    U8,
    U16,
    U32,
}

/// 计数数组的元素布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountLayout {
    /// 所有元素打包在一个数据块里（如 KSIZ + KWDA）
    Packed,
    /// 每个元素一个数据块（如 COCT + CNTO...）
    Repeated,
}

/// 字段基数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Required,
    Optional,
    /// 零个或多个连续数据块
    Repeated,
    /// 先读计数字段，再读恰好该数量的元素
    Counted {
        count: Signature,
        width: CountWidth,
        layout: CountLayout,
    },
}

/// 字段表中的一项
#[derive(Debug, Clone, Copy)]
pub struct FieldEntry {
    pub signature: Signature,
    pub cardinality: Cardinality,
    pub codec: Codec,
}

impl FieldEntry {
    pub const fn required(signature: &[u8; 4], codec: Codec) -> Self {
        FieldEntry { signature: Signature(*signature), cardinality: Cardinality::Required, codec }
    }

    pub const fn optional(signature: &[u8; 4], codec: Codec) -> Self {
        FieldEntry { signature: Signature(*signature), cardinality: Cardinality::Optional, codec }
    }

    pub const fn repeated(signature: &[u8; 4], codec: Codec) -> Self {
        FieldEntry { signature: Signature(*signature), cardinality: Cardinality::Repeated, codec }
    }

    pub const fn counted(
        count: &[u8; 4],
        width: CountWidth,
        layout: CountLayout,
        signature: &[u8; 4],
        codec: Codec,
    ) -> Self {
        FieldEntry {
            signature: Signature(*signature),
            cardinality: Cardinality::Counted { count: Signature(*count), width, layout },
            codec,
        }
    }

    /// 在数据流中标识这一项的第一个签名
    pub fn lead_signature(&self) -> Signature {
        match self.cardinality {
            Cardinality::Counted { count, .. } => count,
            _ => self.signature,
        }
    }

    pub fn is_required(&self) -> bool {
        self.cardinality == Cardinality::Required
    }
}

/// 一种记录类型的完整字段表
#[derive(Debug)]
pub struct RecordSchema {
    pub signature: Signature,
    pub entries: &'static [FieldEntry],
}

impl RecordSchema {
    pub fn entry_index(&self, signature: Signature) -> Option<usize> {
        self.entries.iter().position(|e| e.signature == signature)
    }
}

/// 记录类型（封闭的标签联合，未编目的类型使用通用字段表）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    /// 插件头部
    Tes4,
    /// 钥匙
    Keym,
    /// 关键字
    Kywd,
    /// 全局变量
    Glob,
    Other(Signature),
}

impl RecordType {
    pub fn from_signature(signature: Signature) -> Self {
        match signature.as_bytes() {
            b"TES4" => RecordType::Tes4,
            b"KEYM" => RecordType::Keym,
            b"KYWD" => RecordType::Kywd,
            b"GLOB" => RecordType::Glob,
            _ => RecordType::Other(signature),
        }
    }

    pub fn signature(self) -> Signature {
        match self {
            RecordType::Tes4 => Signature(*b"TES4"),
            RecordType::Keym => Signature(*b"KEYM"),
            RecordType::Kywd => Signature(*b"KYWD"),
            RecordType::Glob => Signature(*b"GLOB"),
            RecordType::Other(signature) => signature,
        }
    }

    pub fn schema(self) -> &'static RecordSchema {
        match self {
            RecordType::Tes4 => &catalog::TES4,
            RecordType::Keym => &catalog::KEYM,
            RecordType::Kywd => &catalog::KYWD,
            RecordType::Glob => &catalog::GLOB,
            RecordType::Other(_) => &catalog::GENERIC,
        }
    }

    /// 是否有专门编目的字段表
    pub fn is_catalogued(self) -> bool {
        !matches!(self, RecordType::Other(_))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature())
    }
}

impl Serialize for RecordType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.signature().serialize(serializer)
    }
}

impl From<Signature> for RecordType {
    fn from(signature: Signature) -> Self {
        RecordType::from_signature(signature)
    }
}
