use crate::arena::Handle;
use crate::datatypes::{GameType, ModFlags, RawString, RecordFlags, Signature};
use crate::formid::{FormKey, LocalRef, OBJECT_ID_MASK};
use crate::group::{Group, GroupChild};
use crate::record::{RecordHeader, RecordId};
use crate::schema::catalog;
use crate::schema::{FieldValue, RecordFields, RecordType, Scalar};
use crate::utils::{EspError, Result};
use std::collections::HashMap;

pub mod parser;
pub mod stats;
pub mod writer;

pub use parser::ParsedPlugin;
pub use stats::PluginStats;

/// 集合中插件的句柄
pub type PluginId = Handle<Plugin>;

/// 低于此值的对象编号保留给引擎
pub const FIRST_OBJECT_ID: u32 = 0x800;

const HEDR: Signature = Signature(*b"HEDR");
const MAST: Signature = Signature(*b"MAST");
const DATA: Signature = Signature(*b"DATA");

/// 插件（一个 ESP/ESM 文件）
///
/// 记录本身存放在集合的记录池中，插件只保存记录树中的句柄。
#[derive(Debug)]
pub struct Plugin {
    /// 文件名
    pub name: String,
    pub flags: ModFlags,
    pub game: GameType,
    /// 头部记录（TES4）
    pub header: RecordHeader,
    pub header_fields: RecordFields,
    /// 读入时的头部字节
    pub(crate) header_original: Option<Vec<u8>>,
    /// 主文件列表
    pub masters: Vec<String>,
    /// 记录的 `original` 字节写入时的主文件列表
    pub(crate) original_masters: Vec<String>,
    /// 组列表
    pub groups: Vec<Group<RecordId>>,
    /// 本插件中每个稳定身份对应的记录
    pub(crate) by_key: HashMap<FormKey, RecordId>,
    pub(crate) orphans: Vec<RecordId>,
    loaded: bool,
    dirty: bool,
}

impl Plugin {
    /// 新建一个未加载的插件
    pub fn new(name: String, flags: ModFlags, game: GameType) -> Self {
        let mut header_fields = RecordFields::for_type(RecordType::Tes4);
        header_fields.put(
            HEDR,
            Some(FieldValue::Struct(vec![
                Scalar::F32(game.default_version()),
                Scalar::U32(0),
                Scalar::U32(FIRST_OBJECT_ID),
            ])),
        );

        Plugin {
            name,
            flags,
            game,
            header: RecordHeader::new(Signature(*b"TES4"), LocalRef(0), game),
            header_fields,
            header_original: None,
            masters: Vec::new(),
            original_masters: Vec::new(),
            groups: Vec::new(),
            by_key: HashMap::new(),
            orphans: Vec::new(),
            loaded: false,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// 自上次读入或保存后是否有改动
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_saveable(&self) -> bool {
        self.flags.contains(ModFlags::SAVEABLE)
    }

    /// 检查是否为主文件
    pub fn is_master(&self) -> bool {
        self.header.flags.contains(RecordFlags::MASTER_FILE)
            || self.name.to_ascii_lowercase().ends_with(".esm")
    }

    /// 检查是否本地化
    pub fn is_localized(&self) -> bool {
        self.header.flags.contains(RecordFlags::LOCALIZED)
    }

    fn hedr(&self) -> Option<&[Scalar]> {
        self.header_fields.value(HEDR).and_then(FieldValue::as_scalars)
    }

    pub fn version(&self) -> f32 {
        match self.hedr().and_then(|h| h.first().copied()) {
            Some(Scalar::F32(version)) => version,
            _ => self.game.default_version(),
        }
    }

    /// HEDR 中的记录数
    pub fn record_count(&self) -> u32 {
        self.hedr()
            .and_then(|h| h.get(1))
            .and_then(Scalar::as_u64)
            .unwrap_or(0) as u32
    }

    pub fn next_object_id(&self) -> u32 {
        self.hedr()
            .and_then(|h| h.get(2))
            .and_then(Scalar::as_u64)
            .map(|id| id as u32)
            .unwrap_or(FIRST_OBJECT_ID)
    }

    pub(crate) fn set_record_count(&mut self, count: u32) {
        set_hedr(&mut self.header_fields, 1, count);
    }

    pub(crate) fn set_next_object_id(&mut self, id: u32) {
        set_hedr(&mut self.header_fields, 2, id);
    }

    /// 分配一个新的对象编号；编号用尽时报错，不会回绕到 0
    pub(crate) fn allocate_object_id(&mut self) -> Result<u32> {
        let mut id = self.next_object_id().max(FIRST_OBJECT_ID);
        while id <= OBJECT_ID_MASK && self.by_key.keys().any(|key| key.object_id == id) {
            id += 1;
        }
        if id > OBJECT_ID_MASK {
            return Err(EspError::ObjectIdsExhausted(self.name.clone()));
        }
        self.set_next_object_id(id + 1);
        Ok(id)
    }

    /// 作者（CNAM）
    pub fn author(&self) -> Option<&str> {
        self.header_fields.value(Signature(*b"CNAM")).and_then(FieldValue::as_str)
    }

    /// 描述（SNAM）
    pub fn description(&self) -> Option<&str> {
        self.header_fields.value(Signature(*b"SNAM")).and_then(FieldValue::as_str)
    }

    /// 从头部字段读出主文件列表
    pub(crate) fn masters_from_header(fields: &RecordFields) -> Vec<String> {
        match fields.value(MAST) {
            Some(FieldValue::List(items)) => items
                .iter()
                .filter_map(|item| match item {
                    FieldValue::Object(master) => master.value(MAST).and_then(FieldValue::as_str),
                    _ => None,
                })
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// 按主文件列表生成头部的 MAST/DATA 字段，保留原有条目的 DATA
    pub(crate) fn header_with_masters(&self, masters: &[String]) -> RecordFields {
        let mut fields = self.header_fields.clone();
        let existing: Vec<FieldValue> = match fields.value(MAST) {
            Some(FieldValue::List(items)) => items.clone(),
            _ => Vec::new(),
        };

        let items: Vec<FieldValue> = masters
            .iter()
            .map(|name| {
                existing
                    .iter()
                    .find(|item| match item {
                        FieldValue::Object(master) => master.value(MAST).and_then(FieldValue::as_str) == Some(name.as_str()),
                        _ => false,
                    })
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut master = RecordFields::with_defaults(catalog::MASTER);
                        master.put(MAST, Some(FieldValue::String(RawString::new(name.as_str()))));
                        master.put(DATA, Some(FieldValue::Struct(vec![Scalar::U64(0)])));
                        FieldValue::Object(master)
                    })
            })
            .collect();

        fields.put(MAST, (!items.is_empty()).then_some(FieldValue::List(items)));
        fields
    }

    /// 记录树中的全部记录（深度优先，包括孤立记录）
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.groups.iter().flat_map(|g| g.records()).copied().collect()
    }

    /// 按稳定身份查找本插件中的记录
    pub fn find(&self, key: FormKey) -> Option<RecordId> {
        self.by_key.get(&key).copied()
    }

    pub fn orphans(&self) -> &[RecordId] {
        &self.orphans
    }

    /// 统计组数量
    pub fn count_groups(&self) -> usize {
        self.groups.iter().map(Group::count_groups).sum()
    }

    /// 不含记录的组数量
    pub fn count_empty_groups(&self) -> usize {
        self.groups.iter().map(Group::count_empty_groups).sum()
    }

    /// 顶级组（不存在时创建）
    pub(crate) fn top_group_mut(&mut self, signature: Signature) -> &mut Group<RecordId> {
        let position = self
            .groups
            .iter()
            .position(|g| g.header.label_signature() == signature && g.header.parent.is_none());
        let index = match position {
            Some(index) => index,
            None => {
                self.groups.push(Group::new(crate::group::GroupHeader::top(signature)));
                self.groups.len() - 1
            }
        };
        &mut self.groups[index]
    }

    /// 从记录树中移除记录
    pub(crate) fn remove_from_tree(&mut self, id: RecordId) {
        for group in &mut self.groups {
            group.retain_records(&mut |r| *r != id);
        }
    }

    /// 清空记录树，保留插件名、标志和加载顺序位置
    pub(crate) fn reset_contents(&mut self) {
        let name = std::mem::take(&mut self.name);
        *self = Plugin::new(name, self.flags, self.game);
    }

    /// 把记录放到父记录之后的子组中
    pub(crate) fn insert_child(
        &mut self,
        parent: RecordId,
        parent_key: FormKey,
        group_type: crate::group::GroupType,
        record: RecordId,
    ) -> bool {
        self.groups
            .iter_mut()
            .any(|group| insert_child_in(group, parent, parent_key, group_type, record))
    }
}

/// 写入 HEDR 的第 `index` 个成员（记录数 / 下一个对象编号）
pub(crate) fn set_hedr(fields: &mut RecordFields, index: usize, value: u32) {
    if let Some(FieldValue::Struct(members)) = fields.value_mut(HEDR) {
        if let Some(slot) = members.get_mut(index) {
            *slot = Scalar::U32(value);
        }
    }
}

fn insert_child_in(
    group: &mut Group<RecordId>,
    parent: RecordId,
    parent_key: FormKey,
    group_type: crate::group::GroupType,
    record: RecordId,
) -> bool {
    let Some(position) = group
        .children
        .iter()
        .position(|child| matches!(child, GroupChild::Record(r) if *r == parent))
    else {
        return group.children.iter_mut().any(|child| match child {
            GroupChild::Group(sub) => insert_child_in(sub, parent, parent_key, group_type, record),
            GroupChild::Record(_) => false,
        });
    };

    // 父记录之后已有的子组
    let existing = group.children[position + 1..].iter_mut().find_map(|child| match child {
        GroupChild::Group(sub) if sub.header.parent == Some(parent_key) => Some(sub),
        _ => None,
    });
    match existing {
        Some(sub) => sub.children.push(GroupChild::Record(record)),
        None => {
            let mut sub = Group::new(crate::group::GroupHeader::child(group_type, parent_key));
            sub.children.push(GroupChild::Record(record));
            group.children.insert(position + 1, GroupChild::Group(Box::new(sub)));
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_plugin_header() {
        let plugin = Plugin::new("New.esp".into(), ModFlags::SAVEABLE, GameType::Skyrim);
        assert_eq!(plugin.version(), 1.7);
        assert_eq!(plugin.record_count(), 0);
        assert_eq!(plugin.next_object_id(), FIRST_OBJECT_ID);
        assert!(!plugin.is_master());
        assert!(plugin.is_saveable());
    }

    #[test]
    fn test_allocate_object_ids() {
        let mut plugin = Plugin::new("New.esp".into(), ModFlags::SAVEABLE, GameType::Skyrim);
        assert_eq!(plugin.allocate_object_id().unwrap(), 0x800);
        assert_eq!(plugin.allocate_object_id().unwrap(), 0x801);
        assert_eq!(plugin.next_object_id(), 0x802);
    }

    #[test]
    fn test_object_ids_do_not_wrap_to_null() {
        let mut plugin = Plugin::new("Full.esp".into(), ModFlags::SAVEABLE, GameType::Skyrim);
        plugin.set_next_object_id(OBJECT_ID_MASK);
        assert_eq!(plugin.allocate_object_id().unwrap(), OBJECT_ID_MASK);

        let err = plugin.allocate_object_id().unwrap_err();
        assert!(matches!(err, EspError::ObjectIdsExhausted(ref name) if name == "Full.esp"));
    }

    #[test]
    fn test_header_masters_roundtrip() {
        let plugin = Plugin::new("Patch.esp".into(), ModFlags::SAVEABLE, GameType::Skyrim);
        let masters = vec!["Skyrim.esm".to_string(), "Update.esm".to_string()];
        let fields = plugin.header_with_masters(&masters);
        assert_eq!(Plugin::masters_from_header(&fields), masters);

        let cleared = plugin.header_with_masters(&[]);
        assert!(Plugin::masters_from_header(&cleared).is_empty());
    }

    #[test]
    fn test_esm_extension_is_master() {
        let plugin = Plugin::new("Base.ESM".into(), ModFlags::empty(), GameType::Skyrim);
        assert!(plugin.is_master());
    }
}
