//! FormID 解析：本地引用、集合范围标识与主文件列表

use super::Collection;
use crate::arena::Arena;
use crate::datatypes::ModFlags;
use crate::formid::{FormKey, FormRef, GlobalId, LocalRef, MasterTable};
use crate::plugin::{Plugin, PluginId};
use crate::record::RecordId;
use crate::schema::FormIdEncoder;
use crate::utils::{EspError, Result};
use std::collections::HashSet;

/// 按某个插件的主文件列表把引用编码为本地引用
pub struct LocalEncoder<'a> {
    pub(crate) table: &'a MasterTable,
    pub(crate) plugin: &'a str,
    pub(crate) plugins: &'a Arena<Plugin>,
}

impl FormIdEncoder for LocalEncoder<'_> {
    fn encode_form(&self, form: &FormRef) -> Result<LocalRef> {
        match *form {
            FormRef::Local(local) | FormRef::Unresolved(local) => Ok(local),
            FormRef::Resolved(key) => self.table.localize(key).ok_or_else(|| EspError::NotAMaster {
                plugin: self.plugin.to_string(),
                master: self
                    .plugins
                    .get(key.origin)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|_| "<unloaded plugin>".to_string()),
            }),
        }
    }
}

impl Collection {
    /// 稳定身份 → 集合范围标识（按当前加载顺序计算）
    pub fn global_id(&self, key: FormKey) -> Result<GlobalId> {
        let position = self.position(key.origin)?;
        Ok(GlobalId::new(position as u8, key.object_id))
    }

    /// 集合范围标识 → 稳定身份
    pub fn form_key(&self, global: GlobalId) -> Result<FormKey> {
        let origin = self
            .load_order
            .get(global.load_order_index() as usize)
            .copied()
            .ok_or_else(|| EspError::PluginNotLoaded(format!("load order index {:02X}", global.load_order_index())))?;
        Ok(FormKey::new(origin, global.object_id()))
    }

    /// 记录的集合范围标识；FormID 无法解析时为 `None`
    pub fn record_global_id(&self, record: RecordId) -> Result<Option<GlobalId>> {
        match self.records.get(record)?.key {
            Some(key) => self.global_id(key).map(Some),
            None => Ok(None),
        }
    }

    /// 插件本地引用 → 集合范围标识
    pub fn to_global(&self, plugin: PluginId, local: LocalRef) -> Result<GlobalId> {
        let name = &self.plugins.get(plugin)?.name;
        let key = self.master_table(plugin)?.resolve(local, name)?;
        self.global_id(key)
    }

    /// 集合范围标识 → 插件本地引用
    ///
    /// 来源不在主文件列表中时，若插件可编辑且带有 `ADD_MASTERS`，
    /// 把来源追加为主文件；否则返回 `NotAMaster`。
    pub fn to_local(&mut self, plugin: PluginId, global: GlobalId) -> Result<LocalRef> {
        let result = self.try_to_local(plugin, global);
        self.traced("to_local", result)
    }

    fn try_to_local(&mut self, plugin: PluginId, global: GlobalId) -> Result<LocalRef> {
        let key = self.form_key(global)?;
        self.ensure_master(plugin, key.origin)?;
        self.master_table(plugin)?
            .localize(key)
            .ok_or_else(|| EspError::InvalidArgument(format!("{} could not be localized", global)))
    }

    /// 确保 `origin` 是插件自身或其主文件
    pub(crate) fn ensure_master(&mut self, plugin: PluginId, origin: PluginId) -> Result<()> {
        let table = self.master_table(plugin)?;
        if origin == plugin || table.slots().contains(&Some(origin)) {
            return Ok(());
        }

        let owner = self.plugins.get(plugin)?;
        let master_name = self.plugins.get(origin)?.name.clone();
        if !(owner.is_saveable() && owner.flags.contains(ModFlags::ADD_MASTERS)) {
            return Err(EspError::NotAMaster { plugin: owner.name.clone(), master: master_name });
        }
        self.add_master(plugin, master_name)
    }

    /// 插件中是否有记录带着字段表没有解释的字节
    pub(crate) fn has_opaque_records(&self, plugin: PluginId) -> Result<bool> {
        let owner = self.plugins.get(plugin)?;
        for rid in owner.record_ids() {
            if self.records.get(rid)?.has_opaque_data() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 主文件列表变化会让原始字节中的引用指向别的插件，这类插件不允许改动列表
    pub(crate) fn ensure_masters_unlocked(&self, plugin: PluginId) -> Result<()> {
        if self.has_opaque_records(plugin)? {
            return Err(EspError::MastersLocked(self.plugins.get(plugin)?.name.clone()));
        }
        Ok(())
    }

    /// 追加主文件
    ///
    /// 自身槽位随主文件数量移动，插件的全部记录都要重新编码。
    pub(crate) fn add_master(&mut self, plugin: PluginId, master: String) -> Result<()> {
        self.ensure_masters_unlocked(plugin)?;
        let owner = self.plugins.get_mut(plugin)?;
        if owner.masters.len() >= u8::MAX as usize {
            return Err(EspError::LoadOrderFull);
        }
        tracing::info!(plugin = %owner.name, master = %master, "adding master");
        owner.masters.push(master);
        self.masters_changed(plugin)
    }

    /// 主文件列表改变后同步头部并标记所有记录为已修改
    pub(crate) fn masters_changed(&mut self, plugin: PluginId) -> Result<()> {
        let owner = self.plugins.get_mut(plugin)?;
        owner.header_fields = owner.header_with_masters(&owner.masters);
        owner.mark_dirty();
        for rid in owner.record_ids() {
            if let Ok(record) = self.records.get_mut(rid) {
                record.mark_modified();
            }
        }
        Ok(())
    }

    /// 为插件自身的对象构造本地引用（MakeShortFormID）
    pub fn make_local_ref(&self, plugin: PluginId, object_id: u32) -> Result<LocalRef> {
        let owner = self.plugins.get(plugin)?;
        Ok(LocalRef::new(owner.masters.len() as u8, object_id))
    }

    /// 本地引用 → (来源插件名, 对象编号)
    pub fn long_name(&self, plugin: PluginId, local: LocalRef) -> Result<(String, u32)> {
        let owner = self.plugins.get(plugin)?;
        let key = self.master_table(plugin)?.resolve(local, &owner.name)?;
        Ok((self.plugins.get(key.origin)?.name.clone(), key.object_id))
    }

    /// (来源插件名, 对象编号) → 本地引用
    pub fn from_long_name(&self, plugin: PluginId, master: &str, object_id: u32) -> Result<LocalRef> {
        let owner = self.plugins.get(plugin)?;
        let origin = self
            .plugin_by_name(master)
            .ok_or_else(|| EspError::PluginNotLoaded(master.to_string()))?;
        self.master_table(plugin)?
            .localize(FormKey::new(origin, object_id))
            .ok_or_else(|| EspError::NotAMaster { plugin: owner.name.clone(), master: master.to_string() })
    }

    /// 插件记录实际引用到的来源插件
    pub(crate) fn referenced_origins(&self, plugin: PluginId) -> Result<(HashSet<PluginId>, HashSet<u8>)> {
        let owner = self.plugins.get(plugin)?;
        let mut origins = HashSet::new();
        let mut raw_slots = HashSet::new();

        for rid in owner.record_ids() {
            let record = self.records.get(rid)?;
            match record.key {
                Some(key) => {
                    origins.insert(key.origin);
                }
                None => {
                    raw_slots.insert(record.header.form_id.master_slot());
                }
            }
            if let Some(fields) = record.fields() {
                fields.visit_form_refs(&mut |form| match form {
                    FormRef::Resolved(key) => {
                        origins.insert(key.origin);
                    }
                    FormRef::Unresolved(local) => {
                        raw_slots.insert(local.master_slot());
                    }
                    FormRef::Local(_) => {}
                });
            }
        }
        for group in &owner.groups {
            collect_group_parents(group, &mut origins);
        }
        Ok((origins, raw_slots))
    }

    /// 移除未被引用的主文件，返回移除数量
    ///
    /// 集合中不存在的主文件无法判断是否被引用，总是保留；
    /// 插件中有未解释的字节时全部保留。
    pub fn clean_masters(&mut self, plugin: PluginId) -> Result<usize> {
        let result = self.try_clean_masters(plugin);
        self.traced("clean_masters", result)
    }

    fn try_clean_masters(&mut self, plugin: PluginId) -> Result<usize> {
        let owner = self.plugins.get(plugin)?;
        if !owner.is_saveable() {
            return Err(EspError::ReadOnly(owner.name.clone()));
        }

        let kept = self.cleaned_masters(plugin)?;
        let owner = self.plugins.get(plugin)?;
        let removed = owner.masters.len() - kept.len();
        if removed > 0 {
            tracing::info!(plugin = %owner.name, removed, "removing unreferenced masters");
            self.plugins.get_mut(plugin)?.masters = kept;
            self.masters_changed(plugin)?;
        }
        Ok(removed)
    }

    /// 去掉未被引用的主文件后的列表（不修改插件）
    pub(crate) fn cleaned_masters(&self, plugin: PluginId) -> Result<Vec<String>> {
        let owner = self.plugins.get(plugin)?;
        if self.has_opaque_records(plugin)? {
            tracing::debug!(plugin = %owner.name, "uninterpreted data present, keeping every master");
            return Ok(owner.masters.clone());
        }

        let table = self.master_table(plugin)?;
        let (origins, raw_slots) = self.referenced_origins(plugin)?;
        Ok(owner
            .masters
            .iter()
            .zip(table.slots())
            .enumerate()
            .filter(|(slot, (_, master))| {
                let referenced = master.map_or(true, |master| origins.contains(&master));
                referenced || raw_slots.contains(&(*slot as u8))
            })
            .map(|(_, (name, _))| name.clone())
            .collect())
    }
}

fn collect_group_parents(group: &crate::group::Group<RecordId>, origins: &mut HashSet<PluginId>) {
    if let Some(parent) = group.header.parent {
        origins.insert(parent.origin);
    }
    for child in &group.children {
        if let crate::group::GroupChild::Group(sub) = child {
            collect_group_parents(sub, origins);
        }
    }
}
