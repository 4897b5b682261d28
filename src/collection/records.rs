//! 记录的创建、复制、删除、字段访问与枚举

use super::Collection;
use crate::datatypes::{CreateFlags, Signature};
use crate::formid::{FormKey, FormRef, GlobalId};
use crate::group::{GroupChild, GroupType};
use crate::plugin::{Plugin, PluginId};
use crate::record::{ParsedRecord, Record, RecordBody, RecordId, RecordState};
use crate::schema::{Codec, FieldPath, FieldValue, ParseContext, RecordType};
use crate::utils::{EspError, Result};
use std::io::Cursor;

/// 父记录类型对应的子组类型
fn child_group_type(parent: RecordType) -> Option<GroupType> {
    match parent.signature().as_bytes() {
        b"WRLD" => Some(GroupType::WorldChildren),
        b"CELL" => Some(GroupType::CellTemporaryChildren),
        b"DIAL" => Some(GroupType::TopicChildren),
        _ => None,
    }
}

impl Collection {
    fn editable_plugin(&self, plugin: PluginId) -> Result<&Plugin> {
        let owner = self.plugins.get(plugin)?;
        if !owner.is_saveable() {
            return Err(EspError::ReadOnly(owner.name.clone()));
        }
        if !owner.is_loaded() {
            return Err(EspError::PluginNotLoaded(owner.name.clone()));
        }
        Ok(owner)
    }

    /// 修改记录前检查所属插件可编辑
    fn editable_record(&self, record: RecordId) -> Result<PluginId> {
        let plugin = self.records.get(record)?.plugin;
        self.editable_plugin(plugin)?;
        Ok(plugin)
    }

    /// 在插件中新建记录
    ///
    /// 新记录使用插件分配的对象编号，必填字段为默认值。
    /// `parent` 必须是同一插件中的世界空间、单元格或对话主题。
    pub fn create_record(
        &mut self,
        plugin: PluginId,
        record_type: RecordType,
        editor_id: Option<&str>,
        parent: Option<RecordId>,
    ) -> Result<RecordId> {
        let result = self.try_create_record(plugin, record_type, editor_id, parent);
        self.traced("create_record", result)
    }

    fn try_create_record(
        &mut self,
        plugin: PluginId,
        record_type: RecordType,
        editor_id: Option<&str>,
        parent: Option<RecordId>,
    ) -> Result<RecordId> {
        if record_type == RecordType::Tes4 {
            return Err(EspError::InvalidArgument("TES4 is the plugin header, not a record".into()));
        }
        self.editable_plugin(plugin)?;
        let parent = parent.map(|p| self.parent_slot(plugin, p)).transpose()?;

        let game = self.game();
        let owner = self.plugins.get_mut(plugin)?;
        let key = FormKey::new(plugin, owner.allocate_object_id()?);
        let mut record = Record::new(record_type, plugin, key, game);
        if let (Some(editor_id), Some(fields)) = (editor_id, record.fields_mut()) {
            fields.set_path(&FieldPath::new(Signature::EDID), FieldValue::string(editor_id))?;
        }
        record.parent = parent.map(|(rid, _, _)| rid);

        let rid = self.records.insert(record);
        self.place_record(plugin, rid, record_type, parent)?;
        self.plugins.get_mut(plugin)?.by_key.insert(key, rid);
        self.index_record(key, rid);
        tracing::debug!(record = %record_type, object_id = format_args!("{:06X}", key.object_id), "record created");
        Ok(rid)
    }

    /// 校验父记录，返回 (父记录, 父记录身份, 子组类型)
    fn parent_slot(&self, plugin: PluginId, parent: RecordId) -> Result<(RecordId, FormKey, GroupType)> {
        let record = self.records.get(parent)?;
        if record.plugin != plugin {
            return Err(EspError::InvalidParent("parent belongs to another plugin".into()));
        }
        let key = record
            .key
            .ok_or_else(|| EspError::InvalidParent("parent has no resolvable FormID".into()))?;
        let group_type = child_group_type(record.record_type).ok_or_else(|| {
            EspError::InvalidParent(format!("{} records cannot have children", record.record_type))
        })?;
        Ok((parent, key, group_type))
    }

    /// 把记录放进插件的记录树
    fn place_record(
        &mut self,
        plugin: PluginId,
        rid: RecordId,
        record_type: RecordType,
        parent: Option<(RecordId, FormKey, GroupType)>,
    ) -> Result<()> {
        let owner = self.plugins.get_mut(plugin)?;
        match parent {
            Some((parent, parent_key, group_type)) => {
                if !owner.insert_child(parent, parent_key, group_type, rid) {
                    return Err(EspError::InvalidParent("parent is not in the plugin's record tree".into()));
                }
            }
            None => owner.top_group_mut(record_type.signature()).children.push(GroupChild::Record(rid)),
        }
        owner.mark_dirty();
        Ok(())
    }

    /// 把记录复制到另一个插件
    ///
    /// 带 `SET_AS_OVERRIDE` 时保留源记录身份（成为覆盖记录），否则分配新的对象编号。
    /// 源记录有父记录而目标插件中没有对应的父记录时，带 `COPY_WINNING_PARENT`
    /// 会先把父记录的胜出版本作为覆盖复制过去，否则返回 `InvalidParent`。
    pub fn copy_record(
        &mut self,
        source: RecordId,
        destination: PluginId,
        flags: CreateFlags,
        editor_id: Option<&str>,
    ) -> Result<RecordId> {
        let result = self.try_copy_record(source, destination, flags, editor_id);
        self.traced("copy_record", result)
    }

    fn try_copy_record(
        &mut self,
        source: RecordId,
        destination: PluginId,
        flags: CreateFlags,
        editor_id: Option<&str>,
    ) -> Result<RecordId> {
        self.editable_plugin(destination)?;
        let original = self.records.get(source)?;
        if original.is_malformed() {
            return Err(EspError::InvalidArgument("malformed records cannot be copied".into()));
        }
        if original.plugin != destination && original.has_opaque_data() {
            // 未解释字节中的引用按源插件的槽位写成
            let source_table = self.master_table(original.plugin)?;
            if !self.master_table(destination)?.reads_like(&source_table) {
                return Err(EspError::InvalidArgument(format!(
                    "record holds uninterpreted data whose references would change meaning in {}",
                    self.plugins.get(destination)?.name
                )));
            }
        }
        let mut copy = original.clone();
        let source_parent = original.parent;

        // 父记录
        let parent = match source_parent {
            Some(parent) => Some(self.destination_parent(parent, destination, flags)?),
            None => None,
        };

        let key = if flags.contains(CreateFlags::SET_AS_OVERRIDE) {
            let key = copy
                .key
                .ok_or_else(|| EspError::InvalidArgument("source record has no resolvable FormID".into()))?;
            if self.plugins.get(destination)?.find(key).is_some() {
                let name = self.plugins.get(destination)?.name.clone();
                return Err(EspError::DuplicateRecord { plugin: name, form_id: self.global_id(key)?.0 });
            }
            self.ensure_master(destination, key.origin)?;
            key
        } else {
            FormKey::new(destination, self.plugins.get_mut(destination)?.allocate_object_id()?)
        };

        copy.plugin = destination;
        copy.key = Some(key);
        copy.parent = parent.map(|(rid, _, _)| rid);
        copy.original = None;
        copy.state = RecordState::Modified;
        copy.updated_references = 0;
        if let Some(editor_id) = editor_id {
            if let Some(fields) = copy.fields_mut() {
                fields.set_path(&FieldPath::new(Signature::EDID), FieldValue::string(editor_id))?;
            }
        }

        let record_type = copy.record_type;
        let rid = self.records.insert(copy);
        self.place_record(destination, rid, record_type, parent)?;
        self.plugins.get_mut(destination)?.by_key.insert(key, rid);
        self.index_record(key, rid);
        Ok(rid)
    }

    /// 目标插件中对应源父记录的父记录
    fn destination_parent(
        &mut self,
        source_parent: RecordId,
        destination: PluginId,
        flags: CreateFlags,
    ) -> Result<(RecordId, FormKey, GroupType)> {
        let parent_key = self
            .records
            .get(source_parent)?
            .key
            .ok_or_else(|| EspError::InvalidParent("source parent has no resolvable FormID".into()))?;

        let existing = self.plugins.get(destination)?.find(parent_key);
        let parent = match existing {
            Some(rid) => rid,
            None if flags.contains(CreateFlags::COPY_WINNING_PARENT) => {
                let winner = self
                    .winner_of(parent_key)?
                    .ok_or_else(|| EspError::InvalidParent("parent has no winning version".into()))?;
                self.try_copy_record(
                    winner,
                    destination,
                    CreateFlags::SET_AS_OVERRIDE | CreateFlags::COPY_WINNING_PARENT,
                    None,
                )?
            }
            None => {
                return Err(EspError::InvalidParent(format!(
                    "{} has no copy of the parent record",
                    self.plugins.get(destination)?.name
                )))
            }
        };
        self.parent_slot(destination, parent)
    }

    /// 标记删除（墓碑）
    pub fn delete_record(&mut self, record: RecordId) -> Result<()> {
        let result = self.try_delete_record(record);
        self.traced("delete_record", result)
    }

    fn try_delete_record(&mut self, record: RecordId) -> Result<()> {
        let plugin = self.editable_record(record)?;
        self.records.get_mut(record)?.mark_deleted();
        self.plugins.get_mut(plugin)?.mark_dirty();
        Ok(())
    }

    /// 丢弃修改，从最近一次读入或写出的字节重新解析
    pub fn reset_record(&mut self, record: RecordId) -> Result<()> {
        let result = self.try_reset_record(record);
        self.traced("reset_record", result)
    }

    fn try_reset_record(&mut self, record: RecordId) -> Result<()> {
        let plugin = self.records.get(record)?.plugin;
        let owner = self.plugins.get(plugin)?;
        let game = self.game();
        let ctx = ParseContext { localized: owner.is_localized(), lenient: false };
        // 原始字节中的槽位按写入时的主文件列表解释
        let table = self.table_for(plugin, &owner.original_masters);
        let name = owner.name.clone();

        let original = self
            .records
            .get(record)?
            .original
            .clone()
            .ok_or_else(|| EspError::InvalidArgument("record was never loaded or saved".into()))?;
        let parsed = ParsedRecord::parse(&mut Cursor::new(&original[..]), game, &ctx)?;

        let target = self.records.get_mut(record)?;
        target.header = parsed.header;
        target.body = parsed.body;
        target.state = RecordState::Parsed;
        target.updated_references = 0;
        if let RecordBody::Fields(fields) = &mut target.body {
            fields.visit_form_refs_mut(&mut |_, form| {
                table.resolve_ref(form, &name);
            });
        }
        Ok(())
    }

    /// 从集合中卸载单条记录，之后该句柄失效
    ///
    /// 只能卸载未修改且没有子记录的记录；之后保存插件时不再包含它。
    pub fn unload_record(&mut self, record: RecordId) -> Result<()> {
        let result = self.try_unload_record(record);
        self.traced("unload_record", result)
    }

    fn try_unload_record(&mut self, record: RecordId) -> Result<()> {
        let target = self.records.get(record)?;
        if target.is_modified() {
            return Err(EspError::InvalidArgument("modified records cannot be unloaded".into()));
        }
        let (plugin, key) = (target.plugin, target.key);
        if self.plugins.get(plugin)?.record_ids().into_iter().any(|rid| {
            self.records.get(rid).map(|r| r.parent == Some(record)).unwrap_or(false)
        }) {
            return Err(EspError::InvalidArgument("records with children cannot be unloaded".into()));
        }

        self.records.remove(record)?;
        if let Some(key) = key {
            self.unindex(key, record);
        }
        let owner = self.plugins.get_mut(plugin)?;
        if let Some(key) = key {
            if owner.by_key.get(&key) == Some(&record) {
                owner.by_key.remove(&key);
            }
        }
        owner.orphans.retain(|r| *r != record);
        owner.remove_from_tree(record);
        owner.mark_dirty();
        tracing::debug!(plugin = %owner.name, "record unloaded");
        Ok(())
    }

    /// 修改记录的 FormID 和/或编辑器 ID（SetIDFields）
    pub fn set_id_fields(&mut self, record: RecordId, global: Option<GlobalId>, editor_id: Option<&str>) -> Result<()> {
        let result = self.try_set_id_fields(record, global, editor_id);
        self.traced("set_id_fields", result)
    }

    fn try_set_id_fields(&mut self, record: RecordId, global: Option<GlobalId>, editor_id: Option<&str>) -> Result<()> {
        let plugin = self.editable_record(record)?;

        if let Some(global) = global {
            let new_key = self.form_key(global)?;
            let old_key = self.records.get(record)?.key;
            if old_key != Some(new_key) {
                if self.plugins.get(plugin)?.find(new_key).is_some() {
                    return Err(EspError::DuplicateRecord {
                        plugin: self.plugins.get(plugin)?.name.clone(),
                        form_id: global.0,
                    });
                }
                self.ensure_master(plugin, new_key.origin)?;

                let owner = self.plugins.get_mut(plugin)?;
                if let Some(old_key) = old_key {
                    owner.by_key.remove(&old_key);
                }
                owner.by_key.insert(new_key, record);
                owner.orphans.retain(|r| *r != record);
                if let Some(old_key) = old_key {
                    self.unindex(old_key, record);
                }
                self.records.get_mut(record)?.key = Some(new_key);
                self.index_record(new_key, record);
            }
        }

        if let Some(editor_id) = editor_id {
            let target = self.records.get_mut(record)?;
            let fields = target
                .fields_mut()
                .ok_or_else(|| EspError::InvalidArgument("malformed records cannot be edited".into()))?;
            fields.set_path(&FieldPath::new(Signature::EDID), FieldValue::string(editor_id))?;
        }

        self.records.get_mut(record)?.mark_modified();
        self.plugins.get_mut(plugin)?.mark_dirty();
        Ok(())
    }

    /// 记录自身或其字段中是否有无法解析的 FormID
    pub fn has_invalid_form_ids(&self, record: RecordId) -> Result<bool> {
        let target = self.records.get(record)?;
        if target.key.is_none() {
            return Ok(true);
        }
        let mut invalid = false;
        if let Some(fields) = target.fields() {
            fields.visit_form_refs(&mut |form| match form {
                FormRef::Unresolved(_) => invalid = true,
                FormRef::Resolved(key) => invalid |= !self.plugins.contains(key.origin),
                FormRef::Local(local) => invalid |= !local.is_null(),
            });
        }
        Ok(invalid)
    }

    /// 读取字段；未设置的可选字段返回 `None`
    pub fn get_field(&self, record: RecordId, path: &FieldPath) -> Result<Option<FieldValue>> {
        let target = self.records.get(record)?;
        match target.fields() {
            Some(fields) => fields.get_path(path),
            None => Err(EspError::InvalidArgument("malformed records have no fields".into())),
        }
    }

    /// 字段的编码方式
    pub fn field_codec(&self, record: RecordId, path: &FieldPath) -> Result<Codec> {
        let target = self.records.get(record)?;
        let fields = target
            .fields()
            .ok_or_else(|| EspError::InvalidArgument("malformed records have no fields".into()))?;
        Ok(fields.entry_at(path)?.codec)
    }

    /// 设置字段，值必须符合字段的编码方式
    pub fn set_field(&mut self, record: RecordId, path: &FieldPath, value: FieldValue) -> Result<()> {
        let result = self.edit_fields(record, |fields| fields.set_path(path, value));
        self.traced("set_field", result)
    }

    /// 清除可选字段；必填字段恢复为默认值
    pub fn delete_field(&mut self, record: RecordId, path: &FieldPath) -> Result<()> {
        let result = self.edit_fields(record, |fields| fields.delete_path(path));
        self.traced("delete_field", result)
    }

    fn edit_fields(
        &mut self,
        record: RecordId,
        edit: impl FnOnce(&mut crate::schema::RecordFields) -> Result<()>,
    ) -> Result<()> {
        let plugin = self.editable_record(record)?;
        let target = self.records.get_mut(record)?;
        let fields = target
            .fields_mut()
            .ok_or_else(|| EspError::InvalidArgument("malformed records cannot be edited".into()))?;
        edit(fields)?;
        target.mark_modified();
        self.plugins.get_mut(plugin)?.mark_dirty();
        Ok(())
    }

    /// 插件中出现的记录类型（排序、去重）
    pub fn record_types(&self, plugin: PluginId) -> Result<Vec<RecordType>> {
        let owner = self.plugins.get(plugin)?;
        let mut types: Vec<RecordType> = owner
            .record_ids()
            .into_iter()
            .filter_map(|rid| self.records.get(rid).ok())
            .map(|record| record.record_type)
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    /// 插件中某类型的记录（不含已删除和孤立记录）
    pub fn records_of_type(&self, plugin: PluginId, record_type: RecordType) -> Result<Vec<RecordId>> {
        let owner = self.plugins.get(plugin)?;
        Ok(owner
            .record_ids()
            .into_iter()
            .filter(|rid| !owner.orphans.contains(rid))
            .filter(|rid| {
                self.records
                    .get(*rid)
                    .map(|r| r.record_type == record_type && !r.is_deleted())
                    .unwrap_or(false)
            })
            .collect())
    }

    /// 插件中标记删除的记录
    pub fn deleted_records(&self, plugin: PluginId) -> Result<Vec<RecordId>> {
        let owner = self.plugins.get(plugin)?;
        Ok(owner
            .record_ids()
            .into_iter()
            .filter(|rid| self.records.get(*rid).map(Record::is_deleted).unwrap_or(false))
            .collect())
    }

    /// 孤立记录
    pub fn orphans(&self, plugin: PluginId) -> Result<Vec<RecordId>> {
        Ok(self.plugins.get(plugin)?.orphans.clone())
    }

    /// 插件中没有记录
    pub fn is_plugin_empty(&self, plugin: PluginId) -> Result<bool> {
        Ok(self.plugins.get(plugin)?.record_ids().is_empty())
    }

    pub fn num_empty_groups(&self, plugin: PluginId) -> Result<usize> {
        Ok(self.plugins.get(plugin)?.count_empty_groups())
    }

    /// 插件统计信息
    pub fn plugin_stats(&self, plugin: PluginId) -> Result<crate::plugin::PluginStats> {
        Ok(self.plugins.get(plugin)?.stats(&self.records))
    }
}
