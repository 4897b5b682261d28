//! 保存插件
//!
//! 保存是全有或全无的：主文件准备在副本上进行，整个插件先完整编码，
//! 再交给 Writer 原子写入；任何一步失败都不改变内存状态和目标文件。

use super::masters::LocalEncoder;
use super::Collection;
use crate::datatypes::{ModFlags, SaveFlags};
use crate::plugin::writer::EncodeOptions;
use crate::plugin::{set_hedr, PluginId};
use crate::record::RecordState;
use crate::utils::{create_backup, EspError, Result};
use std::path::{Path, PathBuf};

impl Collection {
    /// 保存插件，返回写入的路径
    ///
    /// `destination` 为空时写回 `mods_path/插件名`，相对路径以 `mods_path` 为基准。
    pub fn save_plugin(&mut self, plugin: PluginId, flags: SaveFlags, destination: Option<&Path>) -> Result<PathBuf> {
        let result = self.try_save(plugin, flags, destination);
        self.traced("save_plugin", result)
    }

    fn try_save(&mut self, plugin: PluginId, flags: SaveFlags, destination: Option<&Path>) -> Result<PathBuf> {
        let owner = self.plugins.get(plugin)?;
        if !owner.is_saveable() {
            return Err(EspError::ReadOnly(owner.name.clone()));
        }
        if !owner.is_loaded() {
            return Err(EspError::PluginNotLoaded(owner.name.clone()));
        }

        let start = if flags.contains(SaveFlags::CLEAN_MASTERS) {
            self.cleaned_masters(plugin)?
        } else {
            owner.masters.clone()
        };
        let masters = self.prepare_masters(plugin, start)?;
        let owner = self.plugins.get(plugin)?;
        // 已有字节是按 original_masters 写的，列表不同就全部重新编码
        let masters_changed = masters != owner.original_masters;
        let table = self.table_for(plugin, &masters);

        let mut header_fields = owner.header_with_masters(&masters);
        let rewrite_header = owner.is_dirty() || masters_changed;
        if rewrite_header {
            let count = owner.record_ids().len() + owner.count_groups();
            set_hedr(&mut header_fields, 1, count as u32);
            let next_id = owner
                .by_key
                .keys()
                .filter(|key| key.origin == plugin)
                .map(|key| key.object_id + 1)
                .max()
                .unwrap_or(0)
                .max(owner.next_object_id());
            set_hedr(&mut header_fields, 2, next_id);
        }

        let encoder = LocalEncoder { table: &table, plugin: &owner.name, plugins: &self.plugins };
        let options = EncodeOptions { header_fields: &header_fields, reuse_original: !masters_changed };
        let encoded = owner.encode(&self.records, &encoder, &options)?;

        let path = match destination {
            Some(dest) if dest.is_absolute() => dest.to_path_buf(),
            Some(dest) => self.mods_path().join(dest),
            None => self.mods_path().join(&owner.name),
        };
        if flags.contains(SaveFlags::BACKUP) && path.exists() {
            let backup = create_backup(&path)?;
            tracing::info!(backup = %backup.display(), "backup created");
        }
        self.writer.write(&encoded.bytes, &path)?;

        // 写入成功后才更新内存状态
        let owner = self.plugins.get_mut(plugin)?;
        owner.original_masters = masters.clone();
        owner.masters = masters;
        owner.header_fields = header_fields;
        owner.header_original = Some(encoded.bytes[encoded.header.clone()].to_vec());
        owner.mark_clean();
        let name = owner.name.clone();

        for (rid, range) in &encoded.records {
            let record = self.records.get_mut(*rid)?;
            if record.original.is_none() || record.is_modified() || masters_changed {
                record.original = Some(encoded.record_bytes(range).to_vec());
            }
            if record.state == RecordState::Modified {
                record.state = RecordState::Written;
            }
        }

        tracing::info!(plugin = %name, path = %path.display(), bytes = encoded.bytes.len(), "plugin saved");
        self.diagnostics()
            .message(&format!("Saved {} ({} bytes)", name, encoded.bytes.len()));
        Ok(path)
    }

    /// 计算保存后的主文件列表：在 `masters` 基础上，把引用到但不在列表中的来源插件按加载顺序追加
    fn prepare_masters(&self, plugin: PluginId, mut masters: Vec<String>) -> Result<Vec<String>> {
        let owner = self.plugins.get(plugin)?;
        let table = self.table_for(plugin, &masters);
        let (origins, _) = self.referenced_origins(plugin)?;

        let mut missing: Vec<PluginId> = origins
            .into_iter()
            .filter(|&origin| origin != plugin && !table.slots().contains(&Some(origin)))
            .collect();
        missing.sort_by_key(|&origin| self.position(origin).unwrap_or(usize::MAX));

        if !missing.is_empty() {
            self.ensure_masters_unlocked(plugin)?;
        }
        for origin in missing {
            let master = self.plugins.get(origin)?.name.clone();
            if !owner.flags.contains(ModFlags::ADD_MASTERS) {
                return Err(EspError::NotAMaster { plugin: owner.name.clone(), master });
            }
            tracing::info!(plugin = %owner.name, master = %master, "adding master on save");
            masters.push(master);
        }
        if masters.len() > u8::MAX as usize {
            return Err(EspError::LoadOrderFull);
        }
        Ok(masters)
    }
}
