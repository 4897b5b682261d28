//! 插件集合
//!
//! 集合拥有所有插件和记录（两个带代数校验的对象池），维护加载顺序，
//! 以及从稳定身份到各插件中同一对象的覆盖列表（按加载顺序排列）。

use crate::arena::Arena;
use crate::datatypes::{GameType, ModFlags};
use crate::diagnostics::{Diagnostics, NullDiagnostics, ProgressCallback};
use crate::formid::{FormKey, LocalRef, MasterTable};
use crate::group::{Group, GroupChild};
use crate::io::{DefaultEspReader, DefaultEspWriter, EspReader, EspWriter};
use crate::plugin::{ParsedPlugin, Plugin, PluginId};
use crate::record::{ParsedRecord, Record, RecordId};
use crate::utils::{same_plugin_name, EspError, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod masters;
pub mod records;
pub mod save;

/// 加载顺序最多容纳的插件数（GlobalId 高 8 位）
pub const MAX_PLUGINS: usize = 255;

/// 插件集合
pub struct Collection {
    mods_path: PathBuf,
    game: GameType,
    pub(crate) plugins: Arena<Plugin>,
    pub(crate) records: Arena<Record>,
    pub(crate) load_order: Vec<PluginId>,
    /// 稳定身份 → 覆盖列表（按加载顺序）
    pub(crate) index: HashMap<FormKey, Vec<RecordId>>,
    diagnostics: Arc<dyn Diagnostics>,
    reader: Box<dyn EspReader>,
    pub(crate) writer: Box<dyn EspWriter>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("mods_path", &self.mods_path)
            .field("game", &self.game)
            .field("plugins", &self.load_order.len())
            .field("records", &self.records.len())
            .finish()
    }
}

impl Collection {
    /// 创建空集合
    pub fn new(mods_path: impl Into<PathBuf>, game: GameType) -> Self {
        Collection {
            mods_path: mods_path.into(),
            game,
            plugins: Arena::new(),
            records: Arena::new(),
            load_order: Vec::new(),
            index: HashMap::new(),
            diagnostics: Arc::new(NullDiagnostics),
            reader: Box::new(DefaultEspReader),
            writer: Box::new(DefaultEspWriter),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// 使用自定义 Reader（内存、网络等）
    pub fn with_reader(mut self, reader: impl EspReader + 'static) -> Self {
        self.reader = Box::new(reader);
        self
    }

    pub fn with_writer(mut self, writer: impl EspWriter + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    pub fn game(&self) -> GameType {
        self.game
    }

    pub fn mods_path(&self) -> &Path {
        &self.mods_path
    }

    pub fn diagnostics(&self) -> &dyn Diagnostics {
        &*self.diagnostics
    }

    /// 失败时把操作名交给追踪接收器
    pub(crate) fn traced<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::debug!(operation, "operation failed: {}", e);
            self.diagnostics.raise(operation);
        }
        result
    }

    /// 把插件追加到加载顺序末尾
    pub fn add_plugin(&mut self, name: &str, flags: ModFlags) -> Result<PluginId> {
        let result = self.try_add_plugin(name, flags);
        self.traced("add_plugin", result)
    }

    fn try_add_plugin(&mut self, name: &str, flags: ModFlags) -> Result<PluginId> {
        if name.is_empty() {
            return Err(EspError::InvalidArgument("plugin name is empty".into()));
        }
        if self.plugin_by_name(name).is_some() {
            return Err(EspError::DuplicatePlugin(name.to_string()));
        }
        if self.load_order.len() >= MAX_PLUGINS {
            return Err(EspError::LoadOrderFull);
        }

        let id = self.plugins.insert(Plugin::new(name.to_string(), flags, self.game));
        self.load_order.push(id);
        tracing::debug!(plugin = name, position = self.load_order.len() - 1, "plugin added");
        Ok(id)
    }

    pub fn plugin(&self, id: PluginId) -> Result<&Plugin> {
        self.plugins.get(id)
    }

    pub(crate) fn plugin_mut(&mut self, id: PluginId) -> Result<&mut Plugin> {
        self.plugins.get_mut(id)
    }

    pub fn record(&self, id: RecordId) -> Result<&Record> {
        self.records.get(id)
    }

    pub(crate) fn record_mut(&mut self, id: RecordId) -> Result<&mut Record> {
        self.records.get_mut(id)
    }

    /// 按文件名查找（不区分大小写）
    pub fn plugin_by_name(&self, name: &str) -> Option<PluginId> {
        self.load_order.iter().copied().find(|&id| {
            self.plugins
                .get(id)
                .map(|plugin| same_plugin_name(&plugin.name, name))
                .unwrap_or(false)
        })
    }

    /// 插件在加载顺序中的位置
    pub fn position(&self, id: PluginId) -> Result<usize> {
        self.plugins.get(id)?;
        self.load_order
            .iter()
            .position(|&p| p == id)
            .ok_or(EspError::UseAfterUnload)
    }

    /// 全部插件（按加载顺序）
    pub fn load_order(&self) -> &[PluginId] {
        &self.load_order
    }

    /// 已加载的插件（按加载顺序）
    pub fn loaded_plugins(&self) -> Vec<PluginId> {
        self.load_order
            .iter()
            .copied()
            .filter(|&id| self.plugins.get(id).map(Plugin::is_loaded).unwrap_or(false))
            .collect()
    }

    pub(crate) fn positions(&self) -> HashMap<PluginId, usize> {
        self.load_order.iter().enumerate().map(|(i, &id)| (id, i)).collect()
    }

    /// 调整插件的加载顺序位置，所有 GlobalId 随之变化
    pub fn move_plugin(&mut self, id: PluginId, new_position: usize) -> Result<()> {
        let result = self.try_move_plugin(id, new_position);
        self.traced("move_plugin", result)
    }

    fn try_move_plugin(&mut self, id: PluginId, new_position: usize) -> Result<()> {
        let current = self.position(id)?;
        if new_position >= self.load_order.len() {
            return Err(EspError::InvalidArgument(format!(
                "position {} is outside the load order of {} plugins",
                new_position,
                self.load_order.len()
            )));
        }
        self.load_order.remove(current);
        self.load_order.insert(new_position, id);

        let positions = self.positions();
        let records = &self.records;
        for list in self.index.values_mut() {
            list.sort_by_cached_key(|r| position_of(records, &positions, *r));
        }
        Ok(())
    }

    /// 插件的主文件槽位表（按当前集合内容解析主文件名）
    pub fn master_table(&self, id: PluginId) -> Result<MasterTable> {
        let plugin = self.plugins.get(id)?;
        Ok(self.table_for(id, &plugin.masters))
    }

    pub(crate) fn table_for(&self, id: PluginId, masters: &[String]) -> MasterTable {
        let slots = masters
            .iter()
            .map(|name| self.plugin_by_name(name).filter(|&master| master != id))
            .collect();
        MasterTable::new(id, slots)
    }

    /// 加载所有尚未加载的插件
    ///
    /// 各插件并行读取和解析，然后按加载顺序依次并入索引。
    /// 单个插件失败不影响其余插件，返回第一个错误。
    pub fn load(&mut self, progress: Option<ProgressCallback<'_>>) -> Result<()> {
        let pending: Vec<PluginId> = self
            .load_order
            .iter()
            .copied()
            .filter(|&id| self.plugins.get(id).map(|p| !p.is_loaded()).unwrap_or(false))
            .collect();
        let result = self.load_batch(&pending, progress);
        self.traced("load", result)
    }

    /// 加载单个插件；已加载时什么都不做
    pub fn load_plugin(&mut self, id: PluginId) -> Result<()> {
        let result = match self.plugins.get(id) {
            Ok(plugin) if plugin.is_loaded() => Ok(()),
            Ok(_) => self.load_batch(&[id], None),
            Err(e) => Err(e),
        };
        self.traced("load_plugin", result)
    }

    fn load_batch(&mut self, pending: &[PluginId], mut progress: Option<ProgressCallback<'_>>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let jobs: Vec<(PluginId, String, ModFlags)> = pending
            .iter()
            .map(|&id| self.plugins.get(id).map(|p| (id, p.name.clone(), p.flags)))
            .collect::<Result<_>>()?;
        tracing::info!(count = jobs.len(), "loading plugins");

        // 第一遍：各插件独立读取和解析（并行）
        let reader = &*self.reader;
        let mods_path = &self.mods_path;
        let game = self.game;
        let parsed: Vec<Result<Option<ParsedPlugin>>> = jobs
            .par_iter()
            .map(|(_, name, flags)| read_plugin(reader, mods_path, name, *flags, game))
            .collect();

        // 第二遍：按加载顺序依次并入索引
        let max_position = self.load_order.len().saturating_sub(1) as u32;
        let mut first_error = None;
        for ((id, name, _), parsed) in jobs.iter().zip(parsed) {
            if let Some(callback) = progress.as_deref_mut() {
                let position = self.position(*id)? as u32;
                if !callback(position, max_position, name) {
                    tracing::info!(plugin = %name, "load cancelled");
                    return Err(EspError::Cancelled);
                }
            }

            match parsed.and_then(|parsed| self.merge_plugin(*id, parsed)) {
                Ok(count) => {
                    tracing::debug!(plugin = %name, records = count, "plugin loaded");
                    self.diagnostics.message(&format!("Loaded {} ({} records)", name, count));
                }
                Err(e) => {
                    tracing::warn!(plugin = %name, "failed to load: {}", e);
                    self.diagnostics.message(&format!("Failed to load {}: {}", name, e));
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// 把解析结果并入集合，返回记录数
    fn merge_plugin(&mut self, id: PluginId, parsed: Option<ParsedPlugin>) -> Result<usize> {
        let Some(parsed) = parsed else {
            // CREATE_NEW：空头部
            self.plugins.get_mut(id)?.set_loaded(true);
            return Ok(0);
        };

        self.plugins.get_mut(id)?.apply_header(&parsed);
        let table = self.master_table(id)?;
        let positions = self.positions();
        let plugin = self.plugins.get(id)?;
        let name = plugin.name.clone();
        let skip_new = plugin.flags.contains(ModFlags::SKIP_NEW_RECORDS);

        for (slot, master) in plugin.masters.iter().enumerate() {
            if table.slots()[slot].is_none() {
                tracing::warn!(plugin = %name, master = %master, "master is not in the collection");
            }
        }

        let mut merge = Merge {
            plugin: id,
            name: &name,
            table: &table,
            skip_new,
            records: &mut self.records,
            index: &mut self.index,
            positions: &positions,
            by_key: HashMap::new(),
            orphans: Vec::new(),
            count: 0,
        };
        let groups = parsed
            .groups
            .into_iter()
            .map(|group| merge.group(group, Parent::None))
            .collect::<Result<Vec<_>>>()?;
        let Merge { by_key, orphans, count, .. } = merge;

        if !orphans.is_empty() {
            tracing::warn!(plugin = %name, orphans = orphans.len(), "records kept out of the index");
        }

        let plugin = self.plugins.get_mut(id)?;
        plugin.groups = groups;
        plugin.by_key = by_key;
        plugin.orphans = orphans;
        plugin.set_loaded(true);
        plugin.mark_clean();
        Ok(count)
    }

    /// 卸载插件的全部记录，保留插件条目和加载顺序位置
    pub fn unload_plugin(&mut self, id: PluginId) -> Result<()> {
        let result = self.try_unload(id);
        self.traced("unload_plugin", result)
    }

    fn try_unload(&mut self, id: PluginId) -> Result<()> {
        let plugin = self.plugins.get(id)?;
        let ids = plugin.record_ids();
        let name = plugin.name.clone();

        for rid in &ids {
            let Ok(record) = self.records.remove(*rid) else { continue };
            if let Some(key) = record.key {
                self.unindex(key, *rid);
            }
        }

        self.plugins.get_mut(id)?.reset_contents();
        tracing::debug!(plugin = %name, records = ids.len(), "plugin unloaded");
        Ok(())
    }

    /// 卸载所有插件
    pub fn unload(&mut self) -> Result<()> {
        for id in self.loaded_plugins() {
            self.unload_plugin(id)?;
        }
        Ok(())
    }

    /// 按插件本地引用查找该插件中的记录
    pub fn lookup(&self, plugin: PluginId, local: LocalRef) -> Result<Option<RecordId>> {
        let owner = self.plugins.get(plugin)?;
        let key = self.master_table(plugin)?.resolve(local, &owner.name)?;
        Ok(owner.find(key))
    }

    /// 覆盖列表（按加载顺序）
    pub fn overrides(&self, key: FormKey) -> &[RecordId] {
        self.index.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn index_record(&mut self, key: FormKey, rid: RecordId) {
        let positions = self.positions();
        insert_override(&mut self.index, &self.records, &positions, key, rid);
    }

    pub(crate) fn unindex(&mut self, key: FormKey, rid: RecordId) {
        if let Some(list) = self.index.get_mut(&key) {
            list.retain(|r| *r != rid);
            if list.is_empty() {
                self.index.remove(&key);
            }
        }
    }
}

fn read_plugin(
    reader: &dyn EspReader,
    mods_path: &Path,
    name: &str,
    flags: ModFlags,
    game: GameType,
) -> Result<Option<ParsedPlugin>> {
    if flags.contains(ModFlags::CREATE_NEW) {
        return Ok(None);
    }
    let path = mods_path.join(name);
    if !reader.exists(&path) {
        return Err(EspError::PluginNotLoaded(format!("{} does not exist", path.display())));
    }
    let data = reader.read(&path)?;
    ParsedPlugin::parse(&data, game).map(Some)
}

fn position_of(records: &Arena<Record>, positions: &HashMap<PluginId, usize>, rid: RecordId) -> usize {
    records
        .get(rid)
        .ok()
        .and_then(|record| positions.get(&record.plugin).copied())
        .unwrap_or(usize::MAX)
}

/// 按加载顺序插入覆盖列表
fn insert_override(
    index: &mut HashMap<FormKey, Vec<RecordId>>,
    records: &Arena<Record>,
    positions: &HashMap<PluginId, usize>,
    key: FormKey,
    rid: RecordId,
) {
    let mine = position_of(records, positions, rid);
    let list = index.entry(key).or_default();
    let at = list.partition_point(|r| position_of(records, positions, *r) <= mine);
    list.insert(at, rid);
}

/// 父记录上下文
#[derive(Clone, Copy)]
enum Parent {
    /// 顶级
    None,
    Present(RecordId),
    /// 子组的父记录不在本插件中
    Missing,
}

/// 单个插件并入集合时的状态
struct Merge<'a> {
    plugin: PluginId,
    name: &'a str,
    table: &'a MasterTable,
    skip_new: bool,
    records: &'a mut Arena<Record>,
    index: &'a mut HashMap<FormKey, Vec<RecordId>>,
    positions: &'a HashMap<PluginId, usize>,
    by_key: HashMap<FormKey, RecordId>,
    orphans: Vec<RecordId>,
    count: usize,
}

impl Merge<'_> {
    fn group(&mut self, group: Group<ParsedRecord>, parent: Parent) -> Result<Group<RecordId>> {
        let mut header = group.header;
        let parent = if header.group_type.has_parent_label() {
            match self.table.resolve(header.label_ref(), self.name) {
                Ok(key) => {
                    header.parent = Some(key);
                    self.by_key.get(&key).map_or(Parent::Missing, |&rid| Parent::Present(rid))
                }
                Err(e) => {
                    tracing::warn!(plugin = self.name, "child group label: {}", e);
                    Parent::Missing
                }
            }
        } else {
            parent
        };

        let mut children = Vec::with_capacity(group.children.len());
        for child in group.children {
            match child {
                GroupChild::Group(sub) => children.push(GroupChild::Group(Box::new(self.group(*sub, parent)?))),
                GroupChild::Record(parsed) => {
                    if let Some(rid) = self.record(parsed, parent) {
                        children.push(GroupChild::Record(rid));
                    }
                }
            }
        }
        Ok(Group { header, children })
    }

    fn record(&mut self, parsed: ParsedRecord, parent: Parent) -> Option<RecordId> {
        let mut record = Record::from_parsed(parsed, self.plugin);
        let key = match self.table.resolve(record.header.form_id, self.name) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(plugin = self.name, record = %record.header.signature, "{}", e);
                None
            }
        };
        if self.skip_new && key.is_some_and(|key| key.origin == self.plugin) {
            return None;
        }

        record.key = key;
        if let Parent::Present(rid) = parent {
            record.parent = Some(rid);
        }

        let (table, name) = (self.table, self.name);
        if let Some(fields) = record.fields_mut() {
            fields.visit_form_refs_mut(&mut |path, form| {
                if let Some(e) = table.resolve_ref(form, name) {
                    tracing::debug!(plugin = name, field = %path, "unresolved reference: {}", e);
                }
            });
        }

        let duplicate = key.is_some_and(|key| self.by_key.contains_key(&key));
        if duplicate {
            tracing::warn!(plugin = self.name, form_id = format_args!("{:08X}", record.header.form_id.0), "duplicate record");
        }
        let orphan = record.is_malformed() || key.is_none() || duplicate || matches!(parent, Parent::Missing);

        let rid = self.records.insert(record);
        self.count += 1;
        match key {
            Some(key) if !orphan => {
                self.by_key.insert(key, rid);
                insert_override(self.index, self.records, self.positions, key, rid);
            }
            _ => self.orphans.push(rid),
        }
        Some(rid)
    }
}
