use crate::collection::Collection;
use crate::formid::FormRef;
use crate::group::{Group, GroupChild};
use crate::plugin::PluginId;
use crate::record::{RecordBody, RecordId};
use crate::schema::{FieldValue, RecordFields, Scalar};
use crate::subrecord::Subrecord;
use crate::utils::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// 插件结构调试器
pub struct EspDebugger;

impl EspDebugger {
    /// 把已加载插件的结构 dump 到文件
    pub fn dump_file_structure(collection: &Collection, plugin: PluginId, output_path: &Path) -> Result<()> {
        let mut output = File::create(output_path)?;
        Self::dump(collection, plugin, &mut output)
    }

    /// 把已加载插件的结构写入任意输出
    pub fn dump(collection: &Collection, plugin: PluginId, output: &mut dyn Write) -> Result<()> {
        Self::write_header_info(output, collection, plugin)?;
        Self::write_masters_info(output, collection, plugin)?;
        Self::write_groups_info(output, collection, plugin)?;
        Self::write_orphans_info(output, collection, plugin)?;
        Ok(())
    }

    /// 写入头部信息
    fn write_header_info(output: &mut dyn Write, collection: &Collection, plugin: PluginId) -> Result<()> {
        let owner = collection.plugin(plugin)?;
        writeln!(output, "=== ESP文件结构dump ===")?;
        writeln!(output, "文件: {}", owner.name)?;
        writeln!(output, "游戏: {:?}", owner.game)?;
        writeln!(output, "加载顺序: {:02X}", collection.position(plugin)?)?;
        writeln!(output, "主文件: {}", if owner.is_master() { "是" } else { "否" })?;
        writeln!(output, "本地化: {}", if owner.is_localized() { "是" } else { "否" })?;
        writeln!(output, "可保存: {}", if owner.is_saveable() { "是" } else { "否" })?;
        writeln!(output, "未保存修改: {}", if owner.is_dirty() { "是" } else { "否" })?;
        writeln!(output)?;

        writeln!(output, "=== 头部记录 ===")?;
        writeln!(output, "TES4 {{")?;
        writeln!(output, "  标志位: 0x{:08X}", owner.header.flags.bits())?;
        writeln!(output, "  版本: {}", owner.version())?;
        writeln!(output, "  记录数: {}", owner.record_count())?;
        writeln!(output, "  下一个对象编号: 0x{:06X}", owner.next_object_id())?;
        if let Some(author) = owner.author() {
            writeln!(output, "  作者: \"{}\"", author)?;
        }
        if let Some(description) = owner.description() {
            writeln!(output, "  描述: \"{}\"", description)?;
        }
        writeln!(output, "}}")?;
        writeln!(output)?;
        Ok(())
    }

    /// 写入主文件信息
    fn write_masters_info(output: &mut dyn Write, collection: &Collection, plugin: PluginId) -> Result<()> {
        let owner = collection.plugin(plugin)?;
        let table = collection.master_table(plugin)?;
        writeln!(output, "=== 主文件列表 ({}) ===", owner.masters.len())?;
        for (i, (master, slot)) in owner.masters.iter().zip(table.slots()).enumerate() {
            let state = if slot.is_some() { "" } else { " (未加载)" };
            writeln!(output, "  {:02X}: {}{}", i, master, state)?;
        }
        writeln!(output)?;
        Ok(())
    }

    /// 写入组信息
    fn write_groups_info(output: &mut dyn Write, collection: &Collection, plugin: PluginId) -> Result<()> {
        let owner = collection.plugin(plugin)?;
        writeln!(output, "=== 组结构 ({}) ===", owner.groups.len())?;
        for (i, group) in owner.groups.iter().enumerate() {
            writeln!(output, "组 {}:", i)?;
            Self::dump_group(group, output, collection, 0)?;
            writeln!(output)?;
        }
        Ok(())
    }

    fn write_orphans_info(output: &mut dyn Write, collection: &Collection, plugin: PluginId) -> Result<()> {
        let orphans = collection.plugin(plugin)?.orphans();
        if orphans.is_empty() {
            return Ok(());
        }
        writeln!(output, "=== 孤立记录 ({}) ===", orphans.len())?;
        for &rid in orphans {
            let record = collection.record(rid)?;
            writeln!(
                output,
                "  {} [{:08X}]{}",
                record.header.signature,
                record.header.form_id.0,
                if record.is_malformed() { " (解析失败)" } else { "" }
            )?;
        }
        writeln!(output)?;
        Ok(())
    }

    /// Dump 组结构
    fn dump_group(group: &Group<RecordId>, output: &mut dyn Write, collection: &Collection, indent: usize) -> Result<()> {
        let prefix = "  ".repeat(indent);
        let header = &group.header;

        writeln!(output, "{}GRUP {{", prefix)?;
        match header.parent {
            Some(parent) => {
                let label = collection
                    .global_id(parent)
                    .map(|id| id.to_string())
                    .unwrap_or_else(|_| "<未加载>".to_string());
                writeln!(output, "{}  父记录: {}", prefix, label)?;
            }
            None => writeln!(output, "{}  标签: {}", prefix, header.label_signature())?,
        }
        writeln!(output, "{}  类型: {:?} ({})", prefix, header.group_type, header.group_type.to_i32())?;
        writeln!(output, "{}  时间戳: {}", prefix, header.timestamp)?;
        writeln!(output, "{}  版本控制: {}", prefix, header.version_control_info)?;
        writeln!(output, "{}  子元素数: {}", prefix, group.children.len())?;

        for child in &group.children {
            match child {
                GroupChild::Group(subgroup) => Self::dump_group(subgroup, output, collection, indent + 1)?,
                GroupChild::Record(rid) => Self::dump_record(*rid, output, collection, indent + 1)?,
            }
        }

        writeln!(output, "{}}}", prefix)?;
        Ok(())
    }

    /// Dump 记录结构
    fn dump_record(rid: RecordId, output: &mut dyn Write, collection: &Collection, indent: usize) -> Result<()> {
        let prefix = "  ".repeat(indent);
        let record = collection.record(rid)?;
        let header = &record.header;

        writeln!(output, "{}{} {{", prefix, header.signature)?;
        writeln!(output, "{}  FormID: {:08X}", prefix, header.form_id.0)?;
        match record.key.map(|key| collection.global_id(key)) {
            Some(Ok(global)) => writeln!(output, "{}  GlobalID: {}", prefix, global)?,
            _ => writeln!(output, "{}  GlobalID: <无法解析>", prefix)?,
        }
        writeln!(output, "{}  标志位: 0x{:08X}", prefix, header.flags.bits())?;
        writeln!(output, "{}  状态: {:?}", prefix, record.state)?;
        writeln!(output, "{}  时间戳: {}", prefix, header.timestamp)?;
        writeln!(output, "{}  版本控制: {}", prefix, header.version_control_info)?;
        writeln!(output, "{}  内部版本: {}", prefix, header.internal_version)?;
        if let Some(original) = &record.original {
            writeln!(output, "{}  原始大小: {} bytes", prefix, original.len())?;
        }

        match &record.body {
            RecordBody::Fields(fields) => Self::dump_fields(fields, output, collection, indent + 1)?,
            RecordBody::Malformed(reason) => writeln!(output, "{}  ⚠ 解析失败: {}", prefix, reason)?,
        }

        writeln!(output, "{}}}", prefix)?;
        Ok(())
    }

    fn dump_fields(fields: &RecordFields, output: &mut dyn Write, collection: &Collection, indent: usize) -> Result<()> {
        let prefix = "  ".repeat(indent);
        for entry in fields.entries() {
            if let Some(value) = fields.value(entry.signature) {
                writeln!(output, "{}{}: {}", prefix, entry.signature, Self::format_value(value, collection))?;
            }
        }
        for unknown in fields.unknown_chunks() {
            Self::dump_subrecord(&unknown.chunk, output, indent)?;
        }
        Ok(())
    }

    /// 字段值的单行表示；FormID 显示为当前加载顺序下的 GlobalID
    fn format_value(value: &FieldValue, collection: &Collection) -> String {
        match value {
            FieldValue::Struct(scalars) | FieldValue::Array(scalars) => {
                let items: Vec<String> = scalars.iter().map(|s| Self::format_scalar(s, collection)).collect();
                format!("[{}]", items.join(", "))
            }
            FieldValue::Scalar(scalar) => Self::format_scalar(scalar, collection),
            FieldValue::List(values) => {
                let items: Vec<String> = values.iter().map(|v| Self::format_value(v, collection)).collect();
                format!("[{}]", items.join(", "))
            }
            FieldValue::Bytes(bytes) => Self::hex_preview(bytes),
            FieldValue::Object(fields) => {
                let items: Vec<String> = fields
                    .entries()
                    .iter()
                    .filter_map(|e| fields.value(e.signature).map(|v| format!("{}: {}", e.signature, Self::format_value(v, collection))))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            other => match other.as_str() {
                Some(text) => format!("\"{}\"", text),
                None => format!("{:?}", other),
            },
        }
    }

    fn format_scalar(scalar: &Scalar, collection: &Collection) -> String {
        match scalar {
            Scalar::FormId(FormRef::Resolved(key)) => match collection.global_id(*key) {
                Ok(global) => global.to_string(),
                Err(_) => "<未加载>".to_string(),
            },
            Scalar::FormId(FormRef::Local(local)) => format!("{:08X}", local.0),
            Scalar::FormId(FormRef::Unresolved(local)) => format!("{:08X} (无法解析)", local.0),
            Scalar::F32(v) => format!("{}", v),
            other => other.as_u64().map(|v| v.to_string()).unwrap_or_else(|| format!("{:?}", other)),
        }
    }

    /// Dump 子记录结构
    fn dump_subrecord(subrecord: &Subrecord, output: &mut dyn Write, indent: usize) -> Result<()> {
        let prefix = "  ".repeat(indent);
        writeln!(output, "{}{} (未识别, {} bytes): {}", prefix, subrecord.signature, subrecord.data.len(), Self::hex_preview(&subrecord.data))?;
        Ok(())
    }

    fn hex_preview(data: &[u8]) -> String {
        let preview_len = std::cmp::min(32, data.len());
        let hex_data: Vec<String> = data[..preview_len].iter().map(|b| format!("{:02X}", b)).collect();
        format!("{}{}", hex_data.join(" "), if data.len() > 32 { "..." } else { "" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_preview_truncates() {
        let data: Vec<u8> = (0..40).collect();
        let preview = EspDebugger::hex_preview(&data);
        assert!(preview.starts_with("00 01 02"));
        assert!(preview.ends_with("1F..."));
        assert_eq!(EspDebugger::hex_preview(&[0xAB]), "AB");
    }
}
