use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Write, Cursor};
use std::fmt;
use encoding_rs;
use serde::{Serialize, Serializer};

// 基础整数类型读取函数
pub fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, std::io::Error> {
    cursor.read_u8()
}

pub fn read_i8(cursor: &mut Cursor<&[u8]>) -> Result<i8, std::io::Error> {
    cursor.read_i8()
}

pub fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, std::io::Error> {
    cursor.read_u16::<LittleEndian>()
}

pub fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16, std::io::Error> {
    cursor.read_i16::<LittleEndian>()
}

pub fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, std::io::Error> {
    cursor.read_u32::<LittleEndian>()
}

pub fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32, std::io::Error> {
    cursor.read_i32::<LittleEndian>()
}

pub fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, std::io::Error> {
    cursor.read_u64::<LittleEndian>()
}

pub fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32, std::io::Error> {
    cursor.read_f32::<LittleEndian>()
}

// 基础整数类型写入函数
pub fn write_u8(writer: &mut dyn Write, value: u8) -> Result<(), std::io::Error> {
    writer.write_u8(value)
}

pub fn write_i8(writer: &mut dyn Write, value: i8) -> Result<(), std::io::Error> {
    writer.write_i8(value)
}

pub fn write_u16(writer: &mut dyn Write, value: u16) -> Result<(), std::io::Error> {
    writer.write_u16::<LittleEndian>(value)
}

pub fn write_i16(writer: &mut dyn Write, value: i16) -> Result<(), std::io::Error> {
    writer.write_i16::<LittleEndian>(value)
}

pub fn write_u32(writer: &mut dyn Write, value: u32) -> Result<(), std::io::Error> {
    writer.write_u32::<LittleEndian>(value)
}

pub fn write_i32(writer: &mut dyn Write, value: i32) -> Result<(), std::io::Error> {
    writer.write_i32::<LittleEndian>(value)
}

pub fn write_u64(writer: &mut dyn Write, value: u64) -> Result<(), std::io::Error> {
    writer.write_u64::<LittleEndian>(value)
}

pub fn write_f32(writer: &mut dyn Write, value: f32) -> Result<(), std::io::Error> {
    writer.write_f32::<LittleEndian>(value)
}

/// 4字节签名（记录类型 / 子记录类型 / 组标签）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const GRUP: Signature = Signature(*b"GRUP");
    pub const XXXX: Signature = Signature(*b"XXXX");
    pub const EDID: Signature = Signature(*b"EDID");

    pub const fn new(bytes: &[u8; 4]) -> Self {
        Signature(*bytes)
    }

    /// 从 u32 标签值构造（小端，与磁盘字节序一致）
    pub fn from_u32(value: u32) -> Self {
        Signature(value.to_le_bytes())
    }

    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<&[u8; 4]> for Signature {
    fn from(bytes: &[u8; 4]) -> Self {
        Signature(*bytes)
    }
}

// 支持的编码
const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "windows-1252", "windows-1250", "windows-1251"];

/// 带编码信息的字符串
///
/// 记住解码时使用的编码，重新编码时得到与原文件一致的字节。
/// 比较时只比较文本内容。
#[derive(Debug, Clone)]
pub struct RawString {
    pub content: String,
    pub encoding: String,
    /// 无法按规范形式重建的原始负载（缺少终止符、终止符后有数据等）
    source: Option<Vec<u8>>,
}

impl PartialEq for RawString {
    fn eq(&self, other: &Self) -> bool {
        self.content == other.content
    }
}

impl RawString {
    /// 新建 UTF-8 字符串
    pub fn new(content: impl Into<String>) -> Self {
        RawString {
            content: content.into(),
            encoding: "utf-8".to_string(),
            source: None,
        }
    }

    /// 尝试多种编码解码
    pub fn decode(data: &[u8]) -> Self {
        for encoding_name in SUPPORTED_ENCODINGS {
            if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_name.as_bytes()) {
                let (decoded, _, had_errors) = encoding.decode(data);
                if !had_errors {
                    return RawString {
                        content: decoded.into_owned(),
                        encoding: encoding_name.to_string(),
                        source: None,
                    };
                }
            }
        }

        // 回退到UTF-8，忽略错误
        RawString {
            content: String::from_utf8_lossy(data).into_owned(),
            encoding: "utf-8".to_string(),
            source: None,
        }
    }

    /// Z字符串解析(以null结尾)
    ///
    /// 负载不是规范的 `文本 + 单个null` 时记下原始字节，内容不变就原样写回。
    pub fn parse_zstring(data: &[u8]) -> Self {
        let mut string = Self::decode(zstring_text(data));
        if string.canonical_zstring() != data {
            string.source = Some(data.to_vec());
        }
        string
    }

    /// 按原编码编码为Z字符串（追加null终止符）
    pub fn to_zstring(&self) -> Vec<u8> {
        match &self.source {
            Some(source) if Self::decode(zstring_text(source)).content == self.content => source.clone(),
            _ => self.canonical_zstring(),
        }
    }

    fn canonical_zstring(&self) -> Vec<u8> {
        let encoding = encoding_rs::Encoding::for_label(self.encoding.as_bytes())
            .unwrap_or(encoding_rs::UTF_8);
        let mut bytes = encoding.encode(&self.content).0.into_owned();
        bytes.push(0);
        bytes
    }
}

/// 第一个null之前的部分
fn zstring_text(data: &[u8]) -> &[u8] {
    let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    &data[..null_pos]
}

// 记录标志位定义
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        const MASTER_FILE = 0x00000001;        // ESM标志
        const DELETED = 0x00000020;            // 已删除
        const LOCALIZED = 0x00000080;          // 本地化
        const LIGHT_MASTER = 0x00000200;       // 轻量级主文件
        const PERSISTENT = 0x00000400;         // 持久化
        const DISABLED = 0x00000800;           // 禁用
        const VISIBLE_DISTANT = 0x00008000;    // 远距离可见
        const COMPRESSED = 0x00040000;         // 压缩

        // 保留所有未知位，写回时原样输出
        const _ = !0;
    }
}

// 插件加载/编辑标志
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModFlags: u32 {
        /// 允许创建记录并保存
        const SAVEABLE = 0x00000001;
        /// 允许 to_local 追加缺失的主文件
        const ADD_MASTERS = 0x00000002;
        /// 不读取磁盘文件，从空头部开始
        const CREATE_NEW = 0x00000004;
        /// 加载时跳过插件自身新建的记录（只保留覆盖记录）
        const SKIP_NEW_RECORDS = 0x00000008;
    }
}

// 保存标志
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaveFlags: u32 {
        /// 保存前移除未引用的主文件
        const CLEAN_MASTERS = 0x00000001;
        /// 目标文件已存在时先创建带时间戳的备份
        const BACKUP = 0x00000002;
    }
}

// 记录创建/复制标志
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// 复制时保留源记录的 FormID（作为覆盖记录）
        const SET_AS_OVERRIDE = 0x00000001;
        /// 目标插件缺少父记录时，复制父记录的胜出版本
        const COPY_WINNING_PARENT = 0x00000002;
    }
}

/// 游戏类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GameType {
    Oblivion,
    Fallout3,
    FalloutNewVegas,
    Skyrim,
}

impl GameType {
    /// 记录 / 组头部长度
    pub fn header_size(self) -> usize {
        match self {
            GameType::Oblivion => 20,
            _ => 24,
        }
    }

    /// 新建插件时 HEDR 的版本号
    pub fn default_version(self) -> f32 {
        match self {
            GameType::Oblivion => 1.0,
            GameType::Fallout3 => 0.94,
            GameType::FalloutNewVegas => 1.34,
            GameType::Skyrim => 1.7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_display() {
        let sig = Signature::new(b"KEYM");
        assert_eq!(sig.to_string(), "KEYM");
        assert_eq!(Signature::from_u32(sig.to_u32()), sig);
    }

    #[test]
    fn test_zstring_roundtrip_keeps_encoding() {
        // 0xE9 在 windows-1252 中是 é，不是合法的 UTF-8
        let data = [b'C', b'a', b'f', 0xE9, 0];
        let s = RawString::parse_zstring(&data);
        assert_eq!(s.content, "Café");
        assert_eq!(s.encoding, "windows-1252");
        assert_eq!(s.to_zstring(), data.to_vec());
    }

    #[test]
    fn test_raw_string_eq_ignores_encoding() {
        let a = RawString::new("Key");
        let b = RawString { content: "Key".into(), encoding: "windows-1252".into(), source: None };
        assert_eq!(a, b);
    }

    #[test]
    fn test_irregular_zstring_bytes_are_kept() {
        // 缺少终止符
        let s = RawString::parse_zstring(b"Abc");
        assert_eq!(s.content, "Abc");
        assert_eq!(s.to_zstring(), b"Abc".to_vec());

        // 终止符后的填充
        let padded = b"Abc\0\0xy";
        let s = RawString::parse_zstring(padded);
        assert_eq!(s.content, "Abc");
        assert_eq!(s.to_zstring(), padded.to_vec());

        // 内容改动后按规范形式写出
        let mut s = RawString::parse_zstring(padded);
        s.content = "Abd".into();
        assert_eq!(s.to_zstring(), b"Abd\0".to_vec());
    }

    #[test]
    fn test_record_flags_keep_unknown_bits() {
        let flags = RecordFlags::from_bits_retain(0x0004_0021 | 0x1000);
        assert!(flags.contains(RecordFlags::COMPRESSED));
        assert!(flags.contains(RecordFlags::DELETED));
        assert_eq!(flags.bits(), 0x0004_1021);
    }
}
