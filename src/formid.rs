//! FormID 模型
//!
//! - `LocalRef`: 磁盘上的 32 位引用，高 8 位是 *所在插件自己的* 主文件列表槽位
//! - `GlobalId`: 集合范围的 32 位标识，高 8 位是来源插件在加载顺序中的位置
//! - `FormKey`: 内存中稳定的身份（来源插件句柄 + 对象编号），不随加载顺序变化
//!
//! 槽位等于主文件数量时表示插件自身。

use std::fmt;

use serde::Serialize;

use crate::plugin::PluginId;
use crate::utils::{EspError, Result};

/// 对象编号占用低 24 位
pub const OBJECT_ID_MASK: u32 = 0x00FF_FFFF;

/// 插件本地引用（磁盘格式）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LocalRef(pub u32);

impl LocalRef {
    pub fn new(master_slot: u8, object_id: u32) -> Self {
        LocalRef(((master_slot as u32) << 24) | (object_id & OBJECT_ID_MASK))
    }

    pub fn master_slot(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn object_id(self) -> u32 {
        self.0 & OBJECT_ID_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalRef({:08X})", self.0)
    }
}

/// 集合范围标识（加载顺序位置 + 对象编号）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GlobalId(pub u32);

impl GlobalId {
    pub fn new(load_order_index: u8, object_id: u32) -> Self {
        GlobalId(((load_order_index as u32) << 24) | (object_id & OBJECT_ID_MASK))
    }

    pub fn load_order_index(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn object_id(self) -> u32 {
        self.0 & OBJECT_ID_MASK
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({:08X})", self.0)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// 稳定身份：来源插件 + 对象编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormKey {
    pub origin: PluginId,
    pub object_id: u32,
}

impl FormKey {
    pub fn new(origin: PluginId, object_id: u32) -> Self {
        FormKey { origin, object_id: object_id & OBJECT_ID_MASK }
    }
}

/// 记录字段中的引用值
///
/// 解析后为 `Local`；合并进集合时解析为 `Resolved`，
/// 主文件无法解析时保留为 `Unresolved` 以便诊断。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormRef {
    Local(LocalRef),
    Resolved(FormKey),
    Unresolved(LocalRef),
}

impl FormRef {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, FormRef::Unresolved(_))
    }

    pub fn key(&self) -> Option<FormKey> {
        match self {
            FormRef::Resolved(key) => Some(*key),
            _ => None,
        }
    }
}

/// 一个插件的主文件槽位表
#[derive(Debug, Clone)]
pub struct MasterTable {
    owner: PluginId,
    slots: Vec<Option<PluginId>>,
}

impl MasterTable {
    /// `slots[i]` 是第 i 个主文件在集合中的插件，缺失时为 `None`
    pub fn new(owner: PluginId, slots: Vec<Option<PluginId>>) -> Self {
        MasterTable { owner, slots }
    }

    pub fn owner(&self) -> PluginId {
        self.owner
    }

    pub fn slots(&self) -> &[Option<PluginId>] {
        &self.slots
    }

    /// 槽位对应的来源插件（等于主文件数时为插件自身）
    pub fn slot_origin(&self, slot: u8) -> Option<PluginId> {
        let slot = slot as usize;
        if slot == self.slots.len() {
            Some(self.owner)
        } else {
            self.slots.get(slot).copied().flatten()
        }
    }

    /// 按 `written_for` 写入的原始引用在本表下是否指向同样的插件
    pub fn reads_like(&self, written_for: &MasterTable) -> bool {
        (0..=written_for.slots.len()).all(|slot| {
            let slot = slot as u8;
            written_for.slot_origin(slot).is_some() && self.slot_origin(slot) == written_for.slot_origin(slot)
        })
    }

    /// 本地引用 → 稳定身份
    pub fn resolve(&self, local: LocalRef, plugin_name: &str) -> Result<FormKey> {
        self.slot_origin(local.master_slot())
            .map(|origin| FormKey::new(origin, local.object_id()))
            .ok_or_else(|| EspError::UnresolvedMaster {
                plugin: plugin_name.to_string(),
                slot: local.master_slot(),
            })
    }

    /// 稳定身份 → 本地引用；来源不在主文件列表中时返回 `None`
    pub fn localize(&self, key: FormKey) -> Option<LocalRef> {
        if key.origin == self.owner {
            return Some(LocalRef::new(self.slots.len() as u8, key.object_id));
        }
        self.slots
            .iter()
            .position(|slot| *slot == Some(key.origin))
            .map(|slot| LocalRef::new(slot as u8, key.object_id))
    }

    /// 把字段中的 `Local` 引用解析为 `Resolved` / `Unresolved`
    pub fn resolve_ref(&self, form: &mut FormRef, plugin_name: &str) -> Option<EspError> {
        if let FormRef::Local(local) = *form {
            if local.is_null() {
                return None;
            }
            match self.resolve(local, plugin_name) {
                Ok(key) => *form = FormRef::Resolved(key),
                Err(e) => {
                    *form = FormRef::Unresolved(local);
                    return Some(e);
                }
            }
        }
        None
    }
}
