use crate::arena::Handle;
use crate::datatypes::{read_u16, read_u32, GameType, RecordFlags, Signature};
use crate::formid::{FormKey, FormRef, LocalRef};
use crate::plugin::PluginId;
use crate::schema::engine::{parse_record, write_record};
use crate::schema::{FormIdEncoder, ParseContext, RecordFields, RecordType};
use crate::utils::{EspError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use std::io::{Cursor, Read, Write};

/// 单条记录数据上限
const MAX_RECORD_SIZE: u32 = 100_000_000;
/// 解压后大小上限
const MAX_DECOMPRESSED_SIZE: u32 = 50_000_000;

/// 集合中记录的句柄
pub type RecordId = Handle<Record>;

/// 记录头部
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordHeader {
    /// 记录类型签名
    pub signature: Signature,
    /// 数据大小（不含头部）
    pub data_size: u32,
    /// 标志位
    pub flags: RecordFlags,
    /// 磁盘上的 FormID
    pub form_id: LocalRef,
    /// 时间戳
    pub timestamp: u16,
    /// 版本控制信息
    pub version_control_info: u16,
    /// 内部版本（Oblivion 没有）
    pub internal_version: u16,
    /// 未知字段（Oblivion 没有）
    pub unknown: u16,
}

impl RecordHeader {
    pub fn new(signature: Signature, form_id: LocalRef, game: GameType) -> Self {
        let internal_version = match game {
            GameType::Oblivion => 0,
            GameType::Fallout3 | GameType::FalloutNewVegas => 15,
            GameType::Skyrim => 44,
        };
        RecordHeader {
            signature,
            data_size: 0,
            flags: RecordFlags::empty(),
            form_id,
            timestamp: 0,
            version_control_info: 0,
            internal_version,
            unknown: 0,
        }
    }

    /// 读取头部
    pub fn read(cursor: &mut Cursor<&[u8]>, game: GameType) -> Result<Self> {
        let header_size = game.header_size() as u64;
        if cursor.position() + header_size > cursor.get_ref().len() as u64 {
            return Err(EspError::InvalidFormat("Insufficient data for record header".into()));
        }

        let mut type_bytes = [0u8; 4];
        cursor.read_exact(&mut type_bytes)?;
        let signature = Signature(type_bytes);

        let data_size = read_u32(cursor)?;
        if data_size > MAX_RECORD_SIZE {
            return Err(EspError::InvalidFormat(format!(
                "record {} has an implausible size: {} bytes", signature, data_size
            )));
        }

        let flags = RecordFlags::from_bits_retain(read_u32(cursor)?);
        let form_id = LocalRef(read_u32(cursor)?);
        let timestamp = read_u16(cursor)?;
        let version_control_info = read_u16(cursor)?;
        let (internal_version, unknown) = match game {
            GameType::Oblivion => (0, 0),
            _ => (read_u16(cursor)?, read_u16(cursor)?),
        };

        Ok(RecordHeader {
            signature,
            data_size,
            flags,
            form_id,
            timestamp,
            version_control_info,
            internal_version,
            unknown,
        })
    }

    /// 写入头部，`data_size` 使用传入值
    pub fn write(&self, output: &mut Vec<u8>, form_id: LocalRef, data_size: u32, game: GameType) {
        output.extend_from_slice(self.signature.as_bytes());
        output.extend_from_slice(&data_size.to_le_bytes());
        output.extend_from_slice(&self.flags.bits().to_le_bytes());
        output.extend_from_slice(&form_id.0.to_le_bytes());
        output.extend_from_slice(&self.timestamp.to_le_bytes());
        output.extend_from_slice(&self.version_control_info.to_le_bytes());
        if game != GameType::Oblivion {
            output.extend_from_slice(&self.internal_version.to_le_bytes());
            output.extend_from_slice(&self.unknown.to_le_bytes());
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(RecordFlags::COMPRESSED)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RecordFlags::DELETED)
    }
}

/// 解压记录体：`u32 解压大小` + zlib 流
pub fn decompress(signature: Signature, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(EspError::CompressionError(format!(
            "{}: compressed body too short to hold its size", signature
        )));
    }

    let mut cursor = Cursor::new(data);
    let decompressed_size = read_u32(&mut cursor)?;
    if decompressed_size > MAX_DECOMPRESSED_SIZE {
        return Err(EspError::CompressionError(format!(
            "{}: implausible decompressed size {}", signature, decompressed_size
        )));
    }

    // 多读一个字节即可发现超长的流
    let mut decoder = ZlibDecoder::new(&data[4..]).take(decompressed_size as u64 + 1);
    let mut decompressed = Vec::with_capacity(decompressed_size as usize);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| EspError::CompressionError(format!("{}: {}", signature, e)))?;

    if decompressed.len() != decompressed_size as usize {
        return Err(EspError::CompressionError(format!(
            "{}: expected {} bytes after inflate, got {}",
            signature,
            decompressed_size,
            decompressed.len()
        )));
    }
    Ok(decompressed)
}

/// 压缩记录体
pub fn compress(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    let compressed = encoder.finish()?;

    let mut result = Vec::with_capacity(compressed.len() + 4);
    result.extend_from_slice(&(body.len() as u32).to_le_bytes());
    result.extend_from_slice(&compressed);
    Ok(result)
}

/// 记录体
#[derive(Debug, Clone)]
pub enum RecordBody {
    Fields(RecordFields),
    /// 解析失败，只保留原始字节
    Malformed(String),
}

/// 从字节流读出、尚未并入集合的记录
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub header: RecordHeader,
    pub record_type: RecordType,
    pub body: RecordBody,
    /// 磁盘上的完整记录（含头部）
    pub raw: Vec<u8>,
}

impl ParsedRecord {
    /// 解析一条记录
    ///
    /// 头部错误无法跳过，直接返回；记录体错误只影响这一条记录。
    pub fn parse(cursor: &mut Cursor<&[u8]>, game: GameType, ctx: &ParseContext) -> Result<Self> {
        let start = cursor.position() as usize;
        let header = RecordHeader::read(cursor, game)?;

        let body_start = cursor.position() as usize;
        let body_end = body_start + header.data_size as usize;
        let data = *cursor.get_ref();
        if body_end > data.len() {
            return Err(EspError::InvalidFormat(format!(
                "Insufficient data for record {}: expected {} bytes", header.signature, header.data_size
            )));
        }
        cursor.set_position(body_end as u64);

        let record_type = RecordType::from_signature(header.signature);
        let body = Self::parse_body(&header, &data[body_start..body_end], ctx);

        Ok(ParsedRecord {
            header,
            record_type,
            body,
            raw: data[start..body_end].to_vec(),
        })
    }

    fn parse_body(header: &RecordHeader, payload: &[u8], ctx: &ParseContext) -> RecordBody {
        let ctx = ParseContext { lenient: ctx.lenient || header.is_deleted(), ..*ctx };
        let record_type = RecordType::from_signature(header.signature);

        let result = if header.is_compressed() {
            decompress(header.signature, payload).and_then(|body| parse_record(record_type, &body, &ctx))
        } else {
            parse_record(record_type, payload, &ctx)
        };

        match result {
            Ok(fields) => RecordBody::Fields(fields),
            Err(e) => {
                tracing::warn!(
                    record = %header.signature,
                    form_id = format_args!("{:08X}", header.form_id.0),
                    "record body kept verbatim: {}", e
                );
                RecordBody::Malformed(e.to_string())
            }
        }
    }
}

/// 记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordState {
    /// 从磁盘读入，未修改
    Parsed,
    Modified,
    /// 已写回磁盘
    Written,
    /// 本次会话中标记删除
    Deleted,
}

/// 集合中的记录
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub record_type: RecordType,
    pub body: RecordBody,
    /// 所属插件
    pub plugin: PluginId,
    /// 稳定身份；FormID 无法解析时为 `None`
    pub key: Option<FormKey>,
    /// 父记录（世界空间、单元格、对话主题）
    pub parent: Option<RecordId>,
    /// 最近一次读入或写出的字节
    pub original: Option<Vec<u8>>,
    pub state: RecordState,
    /// `update_references` 累计改写的引用数
    pub updated_references: usize,
}

impl Record {
    pub fn from_parsed(parsed: ParsedRecord, plugin: PluginId) -> Self {
        Record {
            header: parsed.header,
            record_type: parsed.record_type,
            body: parsed.body,
            plugin,
            key: None,
            parent: None,
            original: Some(parsed.raw),
            state: RecordState::Parsed,
            updated_references: 0,
        }
    }

    /// 新建记录，必填字段为默认值
    pub fn new(record_type: RecordType, plugin: PluginId, key: FormKey, game: GameType) -> Self {
        Record {
            header: RecordHeader::new(record_type.signature(), LocalRef(0), game),
            record_type,
            body: RecordBody::Fields(RecordFields::for_type(record_type)),
            plugin,
            key: Some(key),
            parent: None,
            original: None,
            state: RecordState::Modified,
            updated_references: 0,
        }
    }

    pub fn fields(&self) -> Option<&RecordFields> {
        match &self.body {
            RecordBody::Fields(fields) => Some(fields),
            RecordBody::Malformed(_) => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut RecordFields> {
        match &mut self.body {
            RecordBody::Fields(fields) => Some(fields),
            RecordBody::Malformed(_) => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self.body, RecordBody::Malformed(_))
    }

    pub fn is_deleted(&self) -> bool {
        self.header.is_deleted()
    }

    /// 是否带有无法按主文件列表重新编码的字节
    pub fn has_opaque_data(&self) -> bool {
        self.fields().map_or(true, RecordFields::has_opaque_data)
    }

    pub fn editor_id(&self) -> Option<&str> {
        self.fields().and_then(RecordFields::editor_id)
    }

    /// 写出时是否需要重新编码
    pub fn is_modified(&self) -> bool {
        matches!(self.state, RecordState::Modified | RecordState::Deleted) || self.original.is_none()
    }

    pub fn mark_modified(&mut self) {
        if self.state != RecordState::Deleted {
            self.state = RecordState::Modified;
        }
    }

    /// 标记删除（墓碑）：保留在插件中，但不再参与胜出计算
    pub fn mark_deleted(&mut self) {
        self.header.flags.insert(RecordFlags::DELETED);
        self.state = RecordState::Deleted;
    }

    /// 编码为磁盘字节
    ///
    /// 未修改的记录原样写回（包括压缩字节），其余重新编码，
    /// 原本压缩的记录重新压缩。
    pub fn encode(&self, game: GameType, encoder: &dyn FormIdEncoder) -> Result<Vec<u8>> {
        self.encode_with(game, encoder, true)
    }

    /// `reuse_original` 为 `false` 时总是重新编码（主文件列表变化后槽位会移动）
    pub(crate) fn encode_with(
        &self,
        game: GameType,
        encoder: &dyn FormIdEncoder,
        reuse_original: bool,
    ) -> Result<Vec<u8>> {
        if reuse_original && !self.is_modified() {
            if let Some(original) = &self.original {
                return Ok(original.clone());
            }
        }

        let fields = match &self.body {
            RecordBody::Fields(fields) => fields,
            RecordBody::Malformed(reason) => {
                return Err(EspError::InvalidFormat(format!(
                    "record {} {:08X} cannot be re-encoded: {}",
                    self.header.signature, self.header.form_id.0, reason
                )));
            }
        };

        let body = write_record(fields, encoder)?;
        let payload = if self.header.is_compressed() { compress(&body)? } else { body };

        let form_id = match self.key {
            Some(key) => encoder.encode_form(&FormRef::Resolved(key))?,
            None => self.header.form_id,
        };

        let mut output = Vec::with_capacity(payload.len() + game.header_size());
        self.header.write(&mut output, form_id, payload.len() as u32, game);
        output.extend_from_slice(&payload);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::engine::RawFormIds;
    use crate::schema::FieldValue;
    use crate::subrecord::write_chunk;

    fn glob_record(flags: RecordFlags, game: GameType) -> Vec<u8> {
        let mut body = Vec::new();
        write_chunk(&mut body, Signature::EDID, b"gTest\0");
        write_chunk(&mut body, Signature(*b"FNAM"), b"f");
        write_chunk(&mut body, Signature(*b"FLTV"), &1.0f32.to_le_bytes());

        let payload = if flags.contains(RecordFlags::COMPRESSED) { compress(&body).unwrap() } else { body };
        let mut header = RecordHeader::new(Signature(*b"GLOB"), LocalRef(0x0000_0801), game);
        header.flags = flags;
        let mut out = Vec::new();
        header.write(&mut out, header.form_id, payload.len() as u32, game);
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn test_header_sizes() {
        for game in [GameType::Oblivion, GameType::Skyrim] {
            let bytes = glob_record(RecordFlags::empty(), game);
            let mut cursor = Cursor::new(&bytes[..]);
            let header = RecordHeader::read(&mut cursor, game).unwrap();
            assert_eq!(cursor.position() as usize, game.header_size());
            assert_eq!(header.form_id, LocalRef(0x801));
        }
    }

    #[test]
    fn test_compressed_record() {
        let bytes = glob_record(RecordFlags::COMPRESSED, GameType::Skyrim);
        let mut cursor = Cursor::new(&bytes[..]);
        let parsed = ParsedRecord::parse(&mut cursor, GameType::Skyrim, &ParseContext::default()).unwrap();

        let RecordBody::Fields(fields) = &parsed.body else { panic!("压缩记录应能解析") };
        assert_eq!(fields.editor_id(), Some("gTest"));
        assert_eq!(parsed.raw, bytes);
    }

    #[test]
    fn test_corrupt_body_is_kept() {
        let mut bytes = glob_record(RecordFlags::COMPRESSED, GameType::Skyrim);
        // 解压大小字段
        bytes[24] ^= 0xFF;

        let mut cursor = Cursor::new(&bytes[..]);
        let parsed = ParsedRecord::parse(&mut cursor, GameType::Skyrim, &ParseContext::default()).unwrap();
        assert!(matches!(parsed.body, RecordBody::Malformed(_)));
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn test_inflate_stops_at_declared_size() {
        let body = vec![7u8; 4096];
        let mut payload = compress(&body).unwrap();
        // 声明的解压大小比实际小
        payload[..4].copy_from_slice(&16u32.to_le_bytes());

        let err = decompress(Signature(*b"GLOB"), &payload).unwrap_err();
        assert!(err.to_string().contains("expected 16 bytes after inflate, got 17"));
    }

    #[test]
    fn test_truncated_record_fails() {
        let bytes = glob_record(RecordFlags::empty(), GameType::Skyrim);
        let mut cursor = Cursor::new(&bytes[..bytes.len() - 3]);
        assert!(ParsedRecord::parse(&mut cursor, GameType::Skyrim, &ParseContext::default()).is_err());
    }

    #[test]
    fn test_modified_compressed_record_is_recompressed() {
        let bytes = glob_record(RecordFlags::COMPRESSED, GameType::Skyrim);
        let mut cursor = Cursor::new(&bytes[..]);
        let parsed = ParsedRecord::parse(&mut cursor, GameType::Skyrim, &ParseContext::default()).unwrap();

        let mut arena = crate::arena::Arena::new();
        let plugin = arena.insert(crate::plugin::Plugin::new(
            "Test.esp".into(),
            crate::datatypes::ModFlags::empty(),
            GameType::Skyrim,
        ));
        let mut record = Record::from_parsed(parsed, plugin);
        assert_eq!(record.encode(GameType::Skyrim, &RawFormIds).unwrap(), bytes);

        record
            .fields_mut()
            .unwrap()
            .set_path(&b"EDID".into(), FieldValue::string("gChanged"))
            .unwrap();
        record.mark_modified();
        let encoded = record.encode(GameType::Skyrim, &RawFormIds).unwrap();

        let mut cursor = Cursor::new(&encoded[..]);
        let reparsed = ParsedRecord::parse(&mut cursor, GameType::Skyrim, &ParseContext::default()).unwrap();
        assert!(reparsed.header.is_compressed());
        let RecordBody::Fields(fields) = reparsed.body else { panic!("重新压缩的记录应能解析") };
        assert_eq!(fields.editor_id(), Some("gChanged"));
    }
}
