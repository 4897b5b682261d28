use super::Plugin;
use crate::arena::Arena;
use crate::record::Record;
use serde::Serialize;

/// 插件统计信息
#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    pub name: String,
    pub is_master: bool,
    pub is_localized: bool,
    pub version: f32,
    pub master_count: usize,
    pub group_count: usize,
    pub empty_group_count: usize,
    pub record_count: usize,
    pub deleted_count: usize,
    pub orphan_count: usize,
    pub malformed_count: usize,
    /// HEDR 中记录的数量
    pub header_record_count: u32,
}

impl std::fmt::Display for PluginStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== 插件统计信息 ===")?;
        writeln!(f, "名称: {}", self.name)?;
        writeln!(f, "版本: {}", self.version)?;
        writeln!(f, "主文件: {}", if self.is_master { "是" } else { "否" })?;
        writeln!(f, "本地化: {}", if self.is_localized { "是" } else { "否" })?;
        writeln!(f, "依赖主文件数: {}", self.master_count)?;
        writeln!(f, "组数量: {} (空组 {})", self.group_count, self.empty_group_count)?;
        writeln!(f, "记录数量: {}", self.record_count)?;
        writeln!(f, "已删除: {}", self.deleted_count)?;
        writeln!(f, "孤立记录: {}", self.orphan_count)?;
        writeln!(f, "无法解析: {}", self.malformed_count)?;
        writeln!(f, "HEDR 记录数: {}", self.header_record_count)?;
        Ok(())
    }
}

impl Plugin {
    /// 获取统计信息
    pub fn stats(&self, records: &Arena<Record>) -> PluginStats {
        let ids = self.record_ids();
        let loaded: Vec<&Record> = ids.iter().filter_map(|id| records.get(*id).ok()).collect();

        PluginStats {
            name: self.name.clone(),
            is_master: self.is_master(),
            is_localized: self.is_localized(),
            version: self.version(),
            master_count: self.masters.len(),
            group_count: self.count_groups(),
            empty_group_count: self.count_empty_groups(),
            record_count: loaded.len(),
            deleted_count: loaded.iter().filter(|r| r.is_deleted()).count(),
            orphan_count: self.orphans.len(),
            malformed_count: loaded.iter().filter(|r| r.is_malformed()).count(),
            header_record_count: self.record_count(),
        }
    }
}
