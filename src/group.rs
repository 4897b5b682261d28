use crate::datatypes::{read_i32, read_u16, read_u32, GameType, Signature};
use crate::formid::{FormKey, LocalRef};
use crate::record::ParsedRecord;
use crate::schema::ParseContext;
use crate::utils::{EspError, Result};
use std::io::{Cursor, Read};

/// 组大小上限
pub(crate) const MAX_GROUP_SIZE: u32 = 200_000_000;

/// 组类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// 顶级组，标签为记录类型
    Top,
    /// 世界空间子组
    WorldChildren,
    InteriorCellBlock,
    InteriorCellSubBlock,
    ExteriorCellBlock,
    ExteriorCellSubBlock,
    /// 单元格子组
    CellChildren,
    /// 对话主题子组
    TopicChildren,
    CellPersistentChildren,
    CellTemporaryChildren,
    CellVisibleDistantChildren,
    /// 未知类型
    Unknown(i32),
}

impl GroupType {
    /// 转换为i32值
    pub fn to_i32(&self) -> i32 {
        match self {
            GroupType::Top => 0,
            GroupType::WorldChildren => 1,
            GroupType::InteriorCellBlock => 2,
            GroupType::InteriorCellSubBlock => 3,
            GroupType::ExteriorCellBlock => 4,
            GroupType::ExteriorCellSubBlock => 5,
            GroupType::CellChildren => 6,
            GroupType::TopicChildren => 7,
            GroupType::CellPersistentChildren => 8,
            GroupType::CellTemporaryChildren => 9,
            GroupType::CellVisibleDistantChildren => 10,
            GroupType::Unknown(value) => *value,
        }
    }

    /// 标签是否为父记录的 FormID
    pub fn has_parent_label(&self) -> bool {
        matches!(
            self,
            GroupType::WorldChildren
                | GroupType::CellChildren
                | GroupType::TopicChildren
                | GroupType::CellPersistentChildren
                | GroupType::CellTemporaryChildren
                | GroupType::CellVisibleDistantChildren
        )
    }
}

impl From<i32> for GroupType {
    fn from(value: i32) -> Self {
        match value {
            0 => GroupType::Top,
            1 => GroupType::WorldChildren,
            2 => GroupType::InteriorCellBlock,
            3 => GroupType::InteriorCellSubBlock,
            4 => GroupType::ExteriorCellBlock,
            5 => GroupType::ExteriorCellSubBlock,
            6 => GroupType::CellChildren,
            7 => GroupType::TopicChildren,
            8 => GroupType::CellPersistentChildren,
            9 => GroupType::CellTemporaryChildren,
            10 => GroupType::CellVisibleDistantChildren,
            _ => GroupType::Unknown(value),
        }
    }
}

/// 组头部
#[derive(Debug, Clone)]
pub struct GroupHeader {
    /// 标签（记录类型、父记录 FormID 或坐标）
    pub label: [u8; 4],
    pub group_type: GroupType,
    pub timestamp: u16,
    pub version_control_info: u16,
    /// 未知字段（Oblivion 没有）
    pub unknown: u32,
    /// 标签指向的父记录，合并进集合后填写
    pub parent: Option<FormKey>,
}

impl GroupHeader {
    /// 顶级组
    pub fn top(signature: Signature) -> Self {
        GroupHeader {
            label: *signature.as_bytes(),
            group_type: GroupType::Top,
            timestamp: 0,
            version_control_info: 0,
            unknown: 0,
            parent: None,
        }
    }

    /// 子组
    pub fn child(group_type: GroupType, parent: FormKey) -> Self {
        GroupHeader {
            label: [0; 4],
            group_type,
            timestamp: 0,
            version_control_info: 0,
            unknown: 0,
            parent: Some(parent),
        }
    }

    pub fn label_signature(&self) -> Signature {
        Signature(self.label)
    }

    pub fn label_ref(&self) -> LocalRef {
        LocalRef(u32::from_le_bytes(self.label))
    }

    /// 读取头部，返回头部与组大小（含头部）
    pub fn read(cursor: &mut Cursor<&[u8]>, game: GameType) -> Result<(Self, u32)> {
        let header_size = game.header_size() as u64;
        if cursor.position() + header_size > cursor.get_ref().len() as u64 {
            return Err(EspError::InvalidFormat("Insufficient data for group header".into()));
        }

        let mut type_bytes = [0u8; 4];
        cursor.read_exact(&mut type_bytes)?;
        if type_bytes != *Signature::GRUP.as_bytes() {
            return Err(EspError::InvalidFormat(format!(
                "Expected GRUP, found {}", String::from_utf8_lossy(&type_bytes)
            )));
        }

        let size = read_u32(cursor)?;
        if size > MAX_GROUP_SIZE || (size as u64) < header_size {
            return Err(EspError::InvalidFormat(format!("implausible group size: {} bytes", size)));
        }

        let mut label = [0u8; 4];
        cursor.read_exact(&mut label)?;
        let group_type = GroupType::from(read_i32(cursor)?);
        let timestamp = read_u16(cursor)?;
        let version_control_info = read_u16(cursor)?;
        let unknown = match game {
            GameType::Oblivion => 0,
            _ => read_u32(cursor)?,
        };

        Ok((
            GroupHeader { label, group_type, timestamp, version_control_info, unknown, parent: None },
            size,
        ))
    }

    /// 写入头部，大小先写占位符，返回占位符位置
    pub fn write(&self, output: &mut Vec<u8>, label: [u8; 4], game: GameType) -> usize {
        output.extend_from_slice(Signature::GRUP.as_bytes());
        let size_pos = output.len();
        output.extend_from_slice(&[0u8; 4]);
        output.extend_from_slice(&label);
        output.extend_from_slice(&self.group_type.to_i32().to_le_bytes());
        output.extend_from_slice(&self.timestamp.to_le_bytes());
        output.extend_from_slice(&self.version_control_info.to_le_bytes());
        if game != GameType::Oblivion {
            output.extend_from_slice(&self.unknown.to_le_bytes());
        }
        size_pos
    }

    /// 回填组大小（包含"GRUP"的4字节）
    pub fn patch_size(output: &mut [u8], size_pos: usize) {
        let actual_size = (output.len() - size_pos + 4) as u32;
        output[size_pos..size_pos + 4].copy_from_slice(&actual_size.to_le_bytes());
    }
}

/// 组结构
#[derive(Debug, Clone)]
pub struct Group<R> {
    pub header: GroupHeader,
    /// 子元素
    pub children: Vec<GroupChild<R>>,
}

/// 组子元素
#[derive(Debug, Clone)]
pub enum GroupChild<R> {
    /// 子组
    Group(Box<Group<R>>),
    /// 记录
    Record(R),
}

impl<R> Group<R> {
    pub fn new(header: GroupHeader) -> Self {
        Group { header, children: Vec::new() }
    }

    /// 获取所有记录（深度优先）
    pub fn records(&self) -> Vec<&R> {
        let mut records = Vec::new();
        self.collect_records(&mut records);
        records
    }

    fn collect_records<'a>(&'a self, records: &mut Vec<&'a R>) {
        for child in &self.children {
            match child {
                GroupChild::Group(group) => group.collect_records(records),
                GroupChild::Record(record) => records.push(record),
            }
        }
    }

    /// 组数量（包括自身）
    pub fn count_groups(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|child| match child {
                GroupChild::Group(group) => group.count_groups(),
                GroupChild::Record(_) => 0,
            })
            .sum::<usize>()
    }

    /// 不含任何记录的组数量（包括自身）
    pub fn count_empty_groups(&self) -> usize {
        let own = usize::from(self.records().is_empty());
        own + self
            .children
            .iter()
            .map(|child| match child {
                GroupChild::Group(group) => group.count_empty_groups(),
                GroupChild::Record(_) => 0,
            })
            .sum::<usize>()
    }

    /// 逐个转换记录，保持树结构
    pub fn try_map<S, E>(self, f: &mut impl FnMut(R) -> std::result::Result<S, E>) -> std::result::Result<Group<S>, E> {
        let mut children = Vec::with_capacity(self.children.len());
        for child in self.children {
            children.push(match child {
                GroupChild::Group(group) => GroupChild::Group(Box::new(group.try_map(&mut *f)?)),
                GroupChild::Record(record) => GroupChild::Record(f(record)?),
            });
        }
        Ok(Group { header: self.header, children })
    }

    /// 删除不满足条件的记录
    pub fn retain_records(&mut self, keep: &mut impl FnMut(&R) -> bool) {
        self.children.retain_mut(|child| match child {
            GroupChild::Group(group) => {
                group.retain_records(&mut *keep);
                true
            }
            GroupChild::Record(record) => keep(record),
        });
    }
}

impl<R: PartialEq> Group<R> {
    pub fn contains_record(&self, target: &R) -> bool {
        self.children.iter().any(|child| match child {
            GroupChild::Group(group) => group.contains_record(target),
            GroupChild::Record(record) => record == target,
        })
    }
}

impl Group<ParsedRecord> {
    /// 解析组
    pub fn parse(cursor: &mut Cursor<&[u8]>, game: GameType, ctx: &ParseContext) -> Result<Self> {
        let start = cursor.position();
        let (header, size) = GroupHeader::read(cursor, game)?;

        let data_end = start + size as u64;
        if data_end > cursor.get_ref().len() as u64 {
            return Err(EspError::InvalidFormat(format!(
                "Insufficient data for group data: expected {} bytes", size
            )));
        }

        let mut children = Vec::new();
        while cursor.position() < data_end {
            // 预读取4字节判断类型
            let peek_pos = cursor.position() as usize;
            let peek = cursor.get_ref().get(peek_pos..peek_pos + 4);

            if peek == Some(Signature::GRUP.as_bytes().as_slice()) {
                let child_group = Group::parse(cursor, game, ctx)?;
                children.push(GroupChild::Group(Box::new(child_group)));
            } else {
                let record = ParsedRecord::parse(cursor, game, ctx)?;
                children.push(GroupChild::Record(record));
            }
        }

        if cursor.position() != data_end {
            return Err(EspError::InvalidFormat(format!(
                "group {} overruns its size by {} bytes",
                header.label_signature(),
                cursor.position() - data_end
            )));
        }

        Ok(Group { header, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordHeader;

    fn record_bytes(form_id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        crate::subrecord::write_chunk(&mut body, Signature::EDID, b"Kw\0");
        let header = RecordHeader::new(Signature(*b"KYWD"), LocalRef(form_id), GameType::Skyrim);
        let mut out = Vec::new();
        header.write(&mut out, LocalRef(form_id), body.len() as u32, GameType::Skyrim);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_parse_nested_groups() {
        let mut data = Vec::new();
        let outer = GroupHeader::top(Signature(*b"KYWD"));
        let outer_pos = outer.write(&mut data, outer.label, GameType::Skyrim);
        data.extend_from_slice(&record_bytes(0x800));

        let inner = GroupHeader { group_type: GroupType::TopicChildren, ..GroupHeader::top(Signature(*b"KYWD")) };
        let inner_pos = inner.write(&mut data, 0x800u32.to_le_bytes(), GameType::Skyrim);
        data.extend_from_slice(&record_bytes(0x801));
        GroupHeader::patch_size(&mut data, inner_pos);
        GroupHeader::patch_size(&mut data, outer_pos);

        let mut cursor = Cursor::new(&data[..]);
        let group = Group::parse(&mut cursor, GameType::Skyrim, &ParseContext::default()).unwrap();
        assert_eq!(group.records().len(), 2);
        assert_eq!(group.count_groups(), 2);
        assert_eq!(group.count_empty_groups(), 0);

        let GroupChild::Group(child) = &group.children[1] else { panic!("应为子组") };
        assert!(child.header.group_type.has_parent_label());
        assert_eq!(child.header.label_ref(), LocalRef(0x800));
    }

    #[test]
    fn test_group_type_roundtrip() {
        for value in [0, 1, 6, 7, 10, 42] {
            assert_eq!(GroupType::from(value).to_i32(), value);
        }
    }

    #[test]
    fn test_retain_and_map() {
        let mut group: Group<u32> = Group::new(GroupHeader::top(Signature(*b"GLOB")));
        group.children.push(GroupChild::Record(1));
        let mut sub = Group::new(GroupHeader::top(Signature(*b"GLOB")));
        sub.children.push(GroupChild::Record(2));
        group.children.push(GroupChild::Group(Box::new(sub)));

        group.retain_records(&mut |r| *r != 2);
        assert_eq!(group.count_empty_groups(), 1);

        let mapped: Group<String> = group.try_map(&mut |r| Ok::<_, ()>(r.to_string())).unwrap();
        assert_eq!(mapped.records(), vec![&"1".to_string()]);
    }
}
