use super::Plugin;
use crate::arena::Arena;
use crate::formid::FormRef;
use crate::group::{Group, GroupChild, GroupHeader};
use crate::record::{Record, RecordId};
use crate::schema::engine::write_record;
use crate::schema::{FormIdEncoder, RecordFields};
use crate::utils::Result;
use std::ops::Range;

/// 编码后的插件
#[derive(Debug)]
pub struct EncodedPlugin {
    pub bytes: Vec<u8>,
    /// 头部记录所占字节
    pub header: Range<usize>,
    /// 每条记录在 `bytes` 中的位置
    pub records: Vec<(RecordId, Range<usize>)>,
}

impl EncodedPlugin {
    pub fn record_bytes(&self, range: &Range<usize>) -> &[u8] {
        &self.bytes[range.clone()]
    }
}

/// 编码参数
pub(crate) struct EncodeOptions<'a> {
    pub header_fields: &'a RecordFields,
    /// 为 `false` 时所有记录重新编码
    pub reuse_original: bool,
}

impl Plugin {
    /// 编码整个插件（不写盘）
    pub(crate) fn encode(
        &self,
        records: &Arena<Record>,
        encoder: &dyn FormIdEncoder,
        options: &EncodeOptions<'_>,
    ) -> Result<EncodedPlugin> {
        let mut output = Vec::new();

        let reuse_header = options.reuse_original && !self.is_dirty();
        match (&self.header_original, reuse_header) {
            (Some(original), true) => output.extend_from_slice(original),
            _ => {
                let body = write_record(options.header_fields, encoder)?;
                self.header.write(&mut output, self.header.form_id, body.len() as u32, self.game);
                output.extend_from_slice(&body);
            }
        }
        let header = 0..output.len();

        let mut spans = Vec::new();
        for group in &self.groups {
            self.write_group(group, records, encoder, options.reuse_original, &mut output, &mut spans)?;
        }

        Ok(EncodedPlugin { bytes: output, header, records: spans })
    }

    /// 写入组
    fn write_group(
        &self,
        group: &Group<RecordId>,
        records: &Arena<Record>,
        encoder: &dyn FormIdEncoder,
        reuse_original: bool,
        output: &mut Vec<u8>,
        spans: &mut Vec<(RecordId, Range<usize>)>,
    ) -> Result<()> {
        // 父记录标签按当前主文件列表重新计算
        let label = match group.header.parent {
            Some(parent) if group.header.group_type.has_parent_label() => {
                encoder.encode_form(&FormRef::Resolved(parent))?.0.to_le_bytes()
            }
            _ => group.header.label,
        };

        // 临时占位符，稍后计算实际大小
        let size_pos = group.header.write(output, label, self.game);

        for child in &group.children {
            match child {
                GroupChild::Group(subgroup) => {
                    self.write_group(subgroup, records, encoder, reuse_original, output, spans)?;
                }
                GroupChild::Record(id) => {
                    let start = output.len();
                    let bytes = records.get(*id)?.encode_with(self.game, encoder, reuse_original)?;
                    output.extend_from_slice(&bytes);
                    spans.push((*id, start..output.len()));
                }
            }
        }

        GroupHeader::patch_size(output, size_pos);
        Ok(())
    }
}
