use super::Plugin;
use crate::datatypes::{read_u32, GameType, RecordFlags, Signature};
use crate::group::{Group, MAX_GROUP_SIZE};
use crate::record::{ParsedRecord, RecordBody};
use crate::schema::{ParseContext, RecordFields, RecordType};
use crate::utils::{EspError, Result};
use rayon::prelude::*;
use std::io::{Cursor, Read};

/// 从文件字节解析出的插件内容，尚未并入集合
#[derive(Debug)]
pub struct ParsedPlugin {
    pub header: ParsedRecord,
    pub header_fields: RecordFields,
    pub masters: Vec<String>,
    pub groups: Vec<Group<ParsedRecord>>,
}

impl ParsedPlugin {
    /// 解析整个插件文件
    ///
    /// 头部必须是可解析的 TES4 记录；顶级组并行解析。
    pub fn parse(data: &[u8], game: GameType) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = ParsedRecord::parse(&mut cursor, game, &ParseContext::default())?;
        let header_fields = Self::validate_header(&header)?;
        let masters = Plugin::masters_from_header(&header_fields);

        let ctx = ParseContext {
            localized: header.header.flags.contains(RecordFlags::LOCALIZED),
            lenient: false,
        };
        let groups = Self::parse_groups(&mut cursor, data, game, &ctx)?;

        Ok(ParsedPlugin { header, header_fields, masters, groups })
    }

    /// 验证文件头
    fn validate_header(header: &ParsedRecord) -> Result<RecordFields> {
        if header.record_type != RecordType::Tes4 {
            return Err(EspError::InvalidFormat(format!(
                "plugin must start with TES4, found {}", header.header.signature
            )));
        }
        match &header.body {
            RecordBody::Fields(fields) => Ok(fields.clone()),
            RecordBody::Malformed(reason) => {
                Err(EspError::InvalidFormat(format!("unreadable TES4 header: {}", reason)))
            }
        }
    }

    /// 解析所有顶级组（并行）
    fn parse_groups(
        cursor: &mut Cursor<&[u8]>,
        data: &[u8],
        game: GameType,
        ctx: &ParseContext,
    ) -> Result<Vec<Group<ParsedRecord>>> {
        // 第一遍：快速扫描获取所有顶级 Group 边界
        let group_ranges = Self::scan_group_boundaries(cursor, data, game)?;

        // 第二遍：并行解析每个 Group
        group_ranges
            .par_iter()
            .map(|&(start, size)| {
                let group_data = &data[start as usize..(start + size as u64) as usize];
                let mut group_cursor = Cursor::new(group_data);
                Group::parse(&mut group_cursor, game, ctx)
            })
            .collect()
    }

    /// 扫描顶级 Group 边界（用于并行解析）
    fn scan_group_boundaries(cursor: &mut Cursor<&[u8]>, data: &[u8], game: GameType) -> Result<Vec<(u64, u32)>> {
        let mut boundaries = Vec::new();
        let start_pos = cursor.position();

        while cursor.position() < data.len() as u64 {
            let pos = cursor.position();
            if pos + 8 > data.len() as u64 {
                return Err(EspError::InvalidFormat(format!("trailing {} bytes after last group", data.len() as u64 - pos)));
            }

            let mut type_bytes = [0u8; 4];
            cursor.read_exact(&mut type_bytes)?;
            if type_bytes != *Signature::GRUP.as_bytes() {
                return Err(EspError::InvalidFormat(format!(
                    "expected GRUP at offset {}, found {}", pos, String::from_utf8_lossy(&type_bytes)
                )));
            }

            let size = read_u32(cursor)?;
            if (size as usize) < game.header_size() || size > MAX_GROUP_SIZE {
                return Err(EspError::InvalidFormat(format!("implausible group size {} at offset {}", size, pos)));
            }
            if pos + size as u64 > data.len() as u64 {
                return Err(EspError::InvalidFormat(format!(
                    "group at offset {} extends past end of file ({} bytes)", pos, data.len()
                )));
            }

            boundaries.push((pos, size));
            cursor.set_position(pos + size as u64);
        }

        cursor.set_position(start_pos);
        Ok(boundaries)
    }
}

impl Plugin {
    /// 用解析出的头部替换当前头部
    pub(crate) fn apply_header(&mut self, parsed: &ParsedPlugin) {
        self.header = parsed.header.header;
        self.header_fields = parsed.header_fields.clone();
        self.header_original = Some(parsed.header.raw.clone());
        self.masters = parsed.masters.clone();
        self.original_masters = parsed.masters.clone();
    }
}
