//! 通用记录结构引擎
//!
//! 按字段表解释记录体的数据块序列：
//! - 数据块按签名与字段表逐项匹配，允许跳过可选项
//! - 跳过的必填项报 `MissingRequiredField`
//! - 计数项先读计数块，再读恰好该数量的元素，否则报 `CountMismatch`
//! - 子对象由若干连续数据块组成，遇到不属于它的块即结束
//! - 字段表之外的数据块原样保留，写回时放在原来的相对位置
//!
//! 引用类型字段在这一层只保存为 `FormRef::Local`，解析由集合完成。

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::codec::{accepts, decode, decode_count, default_value, encode, encode_count, FieldValue, Scalar};
use super::{Cardinality, Codec, CountLayout, FieldEntry, RecordType};
use crate::datatypes::Signature;
use crate::formid::{FormRef, LocalRef};
use crate::subrecord::{write_chunk, Subrecord};
use crate::utils::{EspError, Result};

/// 解析选项
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseContext {
    /// 插件头部带 LOCALIZED 标志：LString 为字符串 ID
    pub localized: bool,
    /// 不检查必填项（已删除记录通常只剩部分字段）
    pub lenient: bool,
}

/// 写回时把引用编码为插件本地引用
pub trait FormIdEncoder {
    fn encode_form(&self, form: &FormRef) -> Result<LocalRef>;
}

/// 只接受未解析引用的编码器，用于独立于集合的编解码
pub struct RawFormIds;

impl FormIdEncoder for RawFormIds {
    fn encode_form(&self, form: &FormRef) -> Result<LocalRef> {
        match form {
            FormRef::Local(local) | FormRef::Unresolved(local) => Ok(*local),
            FormRef::Resolved(_) => Err(EspError::InvalidArgument(
                "resolved reference cannot be encoded without a master table".into(),
            )),
        }
    }
}

/// 字段表之外的数据块
#[derive(Debug, Clone)]
pub struct UnknownChunk {
    /// 写回时排在第 `anchor` 项之前
    pub anchor: usize,
    pub chunk: Subrecord,
}

/// 一条记录（或一个子对象）的字段值
#[derive(Debug, Clone)]
pub struct RecordFields {
    owner: Signature,
    entries: &'static [FieldEntry],
    values: Vec<Option<FieldValue>>,
    unknown: Vec<UnknownChunk>,
}

impl PartialEq for RecordFields {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
            && self.unknown.len() == other.unknown.len()
            && self
                .unknown
                .iter()
                .zip(&other.unknown)
                .all(|(a, b)| a.chunk == b.chunk)
    }
}

impl RecordFields {
    pub fn new(owner: Signature, entries: &'static [FieldEntry]) -> Self {
        RecordFields {
            owner,
            entries,
            values: vec![None; entries.len()],
            unknown: Vec::new(),
        }
    }

    /// 必填项填入默认值，其余为空
    pub fn with_defaults(entries: &'static [FieldEntry]) -> Self {
        let owner = entries.first().map(|e| e.signature).unwrap_or(Signature::EDID);
        let mut fields = RecordFields::new(owner, entries);
        for (slot, entry) in fields.values.iter_mut().zip(entries) {
            if entry.is_required() {
                *slot = Some(default_value(&entry.codec));
            }
        }
        fields
    }

    /// 新建记录的初始字段
    pub fn for_type(record_type: RecordType) -> Self {
        let mut fields = RecordFields::with_defaults(record_type.schema().entries);
        fields.owner = record_type.signature();
        fields
    }

    pub fn entries(&self) -> &'static [FieldEntry] {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none) && self.unknown.is_empty()
    }

    pub fn unknown_chunks(&self) -> &[UnknownChunk] {
        &self.unknown
    }

    /// 是否含有字段表没有解释的字节（未知数据块、原始字节字段）
    ///
    /// 这些字节里的引用无法随主文件列表变化重新编码。
    pub fn has_opaque_data(&self) -> bool {
        !self.unknown.is_empty() || self.values.iter().flatten().any(is_opaque)
    }

    fn entry_index(&self, signature: Signature) -> Option<usize> {
        self.entries.iter().position(|e| e.signature == signature)
    }

    /// 按签名读取顶层字段
    pub fn value(&self, signature: Signature) -> Option<&FieldValue> {
        self.entry_index(signature).and_then(|i| self.values[i].as_ref())
    }

    pub fn value_mut(&mut self, signature: Signature) -> Option<&mut FieldValue> {
        let index = self.entry_index(signature)?;
        self.values[index].as_mut()
    }

    /// 按签名替换顶层字段（不做类型检查，供内部维护头部等使用）
    pub(crate) fn put(&mut self, signature: Signature, value: Option<FieldValue>) {
        if let Some(index) = self.entry_index(signature) {
            self.values[index] = value;
        }
    }

    pub fn editor_id(&self) -> Option<&str> {
        self.value(Signature::EDID).and_then(FieldValue::as_str)
    }

    fn unknown_field(&self, path: &FieldPath) -> EspError {
        EspError::UnknownField { record_type: self.owner, path: path.to_string() }
    }

    // ---------------------------------------------------------------
    // 按路径访问
    // ---------------------------------------------------------------

    /// 读取路径处的值
    pub fn get_path(&self, path: &FieldPath) -> Result<Option<FieldValue>> {
        self.get_segments(&path.0, path)
    }

    fn get_segments(&self, segments: &[PathSegment], full: &FieldPath) -> Result<Option<FieldValue>> {
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| EspError::InvalidArgument("empty field path".into()))?;
        let index = self.entry_index(first.signature).ok_or_else(|| self.unknown_field(full))?;
        let Some(value) = &self.values[index] else {
            return Ok(None);
        };

        let value = match (first.index, value) {
            (None, value) => value,
            (Some(i), FieldValue::List(items)) => match items.get(i) {
                Some(item) => item,
                None => return Ok(None),
            },
            (Some(i), FieldValue::Struct(members) | FieldValue::Array(members)) if rest.is_empty() => {
                return Ok(members.get(i).map(|s| FieldValue::Scalar(*s)));
            }
            _ => return Err(self.unknown_field(full)),
        };

        match (rest.is_empty(), value) {
            (true, value) => Ok(Some(value.clone())),
            (false, FieldValue::Object(sub)) => sub.get_segments(rest, full),
            (false, _) => Err(self.unknown_field(full)),
        }
    }

    /// 写入路径处的值，值必须符合字段的编解码器
    pub fn set_path(&mut self, path: &FieldPath, value: FieldValue) -> Result<()> {
        self.set_segments(&path.0, path, value)
    }

    fn set_segments(&mut self, segments: &[PathSegment], full: &FieldPath, value: FieldValue) -> Result<()> {
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| EspError::InvalidArgument("empty field path".into()))?;
        let index = self.entry_index(first.signature).ok_or_else(|| self.unknown_field(full))?;
        let entry = self.entries[index];
        let mismatch = || EspError::FieldTypeMismatch(full.to_string());

        if !rest.is_empty() {
            if !matches!(entry.codec, Codec::Object(_)) {
                return Err(self.unknown_field(full));
            }
            let target = if entry.is_list() {
                let items = self.list_mut(index).ok_or_else(mismatch)?;
                let i = first.index.unwrap_or(0);
                if i == items.len() {
                    items.push(default_value(&entry.codec));
                }
                items
                    .get_mut(i)
                    .ok_or_else(|| EspError::InvalidArgument(format!("{} is out of range", full)))?
            } else {
                self.values[index].get_or_insert_with(|| default_value(&entry.codec))
            };
            return match target {
                FieldValue::Object(sub) => sub.set_segments(rest, full, value),
                _ => Err(mismatch()),
            };
        }

        match first.index {
            None => {
                if !entry.accepts(&value) {
                    return Err(mismatch());
                }
                self.values[index] = Some(value);
            }
            Some(i) if entry.is_list() => {
                if !accepts(&entry.codec, &value) {
                    return Err(mismatch());
                }
                let items = self.list_mut(index).ok_or_else(mismatch)?;
                insert_at(items, i, value, full)?;
            }
            Some(i) => {
                let FieldValue::Scalar(scalar) = value else {
                    return Err(mismatch());
                };
                let target = self.values[index].get_or_insert_with(|| default_value(&entry.codec));
                match (target, entry.codec) {
                    (FieldValue::Struct(members), _) => {
                        let slot = members
                            .get_mut(i)
                            .ok_or_else(|| EspError::InvalidArgument(format!("{} is out of range", full)))?;
                        if slot.primitive() != scalar.primitive() {
                            return Err(mismatch());
                        }
                        *slot = scalar;
                    }
                    (FieldValue::Array(elements), Codec::PackedArray(primitive)) => {
                        if primitive != scalar.primitive() {
                            return Err(mismatch());
                        }
                        insert_at(elements, i, scalar, full)?;
                    }
                    _ => return Err(mismatch()),
                }
            }
        }
        Ok(())
    }

    /// 删除路径处的值：可选项清空，必填项恢复默认值
    pub fn delete_path(&mut self, path: &FieldPath) -> Result<()> {
        self.delete_segments(&path.0, path)
    }

    fn delete_segments(&mut self, segments: &[PathSegment], full: &FieldPath) -> Result<()> {
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| EspError::InvalidArgument("empty field path".into()))?;
        let index = self.entry_index(first.signature).ok_or_else(|| self.unknown_field(full))?;
        let entry = self.entries[index];

        if !rest.is_empty() {
            let target = match (first.index, self.values[index].as_mut()) {
                (_, None) => return Ok(()),
                (Some(i), Some(FieldValue::List(items))) => items.get_mut(i),
                (None, Some(FieldValue::List(items))) => items.first_mut(),
                (_, Some(value)) => Some(value),
            };
            return match target {
                Some(FieldValue::Object(sub)) => sub.delete_segments(rest, full),
                Some(_) => Err(self.unknown_field(full)),
                None => Ok(()),
            };
        }

        match (first.index, self.values[index].as_mut()) {
            (None, _) => {
                self.values[index] = entry.is_required().then(|| default_value(&entry.codec));
            }
            (Some(_), None) => {}
            (Some(i), Some(FieldValue::List(items))) => {
                if i < items.len() {
                    items.remove(i);
                }
                if items.is_empty() && !entry.is_required() {
                    self.values[index] = None;
                }
            }
            (Some(i), Some(FieldValue::Array(elements))) => {
                if i < elements.len() {
                    elements.remove(i);
                }
            }
            (Some(i), Some(FieldValue::Struct(members))) => {
                if let Some(slot) = members.get_mut(i) {
                    *slot = Scalar::default_for(slot.primitive());
                }
            }
            (Some(_), Some(_)) => return Err(self.unknown_field(full)),
        }
        Ok(())
    }

    /// 路径对应的字段表项
    pub fn entry_at(&self, path: &FieldPath) -> Result<&'static FieldEntry> {
        let mut entries = self.entries;
        let mut found = None;
        for segment in &path.0 {
            let entry = entries
                .iter()
                .find(|e| e.signature == segment.signature)
                .ok_or_else(|| self.unknown_field(path))?;
            entries = match entry.codec {
                Codec::Object(sub) => sub,
                _ => &[],
            };
            found = Some(entry);
        }
        found.ok_or_else(|| EspError::InvalidArgument("empty field path".into()))
    }

    fn list_mut(&mut self, index: usize) -> Option<&mut Vec<FieldValue>> {
        let slot = &mut self.values[index];
        if slot.is_none() {
            *slot = Some(FieldValue::List(Vec::new()));
        }
        match slot {
            Some(FieldValue::List(items)) => Some(items),
            _ => None,
        }
    }

    // ---------------------------------------------------------------
    // 引用遍历
    // ---------------------------------------------------------------

    /// 遍历所有引用字段，回调收到字段路径
    pub fn visit_form_refs_mut(&mut self, f: &mut dyn FnMut(&FieldPath, &mut FormRef)) {
        let mut prefix = Vec::new();
        self.visit_refs_mut(&mut prefix, f);
    }

    fn visit_refs_mut(&mut self, prefix: &mut Vec<PathSegment>, f: &mut dyn FnMut(&FieldPath, &mut FormRef)) {
        let entries = self.entries;
        for (value, entry) in self.values.iter_mut().zip(entries) {
            if let Some(value) = value {
                visit_value_mut(value, entry.signature, None, prefix, f);
            }
        }
    }

    pub fn visit_form_refs(&self, f: &mut dyn FnMut(&FormRef)) {
        for value in self.values.iter().flatten() {
            visit_value(value, f);
        }
    }
}

fn is_opaque(value: &FieldValue) -> bool {
    match value {
        FieldValue::Bytes(bytes) => !bytes.is_empty(),
        FieldValue::List(items) => items.iter().any(is_opaque),
        FieldValue::Object(sub) => sub.has_opaque_data(),
        _ => false,
    }
}

fn insert_at<T>(items: &mut Vec<T>, index: usize, value: T, path: &FieldPath) -> Result<()> {
    match index.cmp(&items.len()) {
        std::cmp::Ordering::Less => items[index] = value,
        std::cmp::Ordering::Equal => items.push(value),
        std::cmp::Ordering::Greater => {
            return Err(EspError::InvalidArgument(format!("{} is out of range", path)));
        }
    }
    Ok(())
}

fn visit_value_mut(
    value: &mut FieldValue,
    signature: Signature,
    index: Option<usize>,
    prefix: &mut Vec<PathSegment>,
    f: &mut dyn FnMut(&FieldPath, &mut FormRef),
) {
    match value {
        FieldValue::Struct(scalars) | FieldValue::Array(scalars) => {
            for (k, scalar) in scalars.iter_mut().enumerate() {
                if let Scalar::FormId(form) = scalar {
                    prefix.push(PathSegment { signature, index: index.or(Some(k)) });
                    f(&FieldPath(prefix.clone()), form);
                    prefix.pop();
                }
            }
        }
        FieldValue::Scalar(Scalar::FormId(form)) => {
            prefix.push(PathSegment { signature, index });
            f(&FieldPath(prefix.clone()), form);
            prefix.pop();
        }
        FieldValue::List(items) => {
            for (k, item) in items.iter_mut().enumerate() {
                visit_value_mut(item, signature, Some(k), prefix, f);
            }
        }
        FieldValue::Object(sub) => {
            prefix.push(PathSegment { signature, index });
            sub.visit_refs_mut(prefix, f);
            prefix.pop();
        }
        _ => {}
    }
}

fn visit_value(value: &FieldValue, f: &mut dyn FnMut(&FormRef)) {
    match value {
        FieldValue::Struct(scalars) | FieldValue::Array(scalars) => {
            scalars.iter().filter_map(Scalar::as_form).for_each(|form| f(form));
        }
        FieldValue::Scalar(Scalar::FormId(form)) => f(form),
        FieldValue::List(items) => items.iter().for_each(|item| visit_value(item, f)),
        FieldValue::Object(sub) => sub.visit_form_refs(f),
        _ => {}
    }
}

impl FieldEntry {
    /// 值是否为元素列表
    pub fn is_list(&self) -> bool {
        matches!(
            self.cardinality,
            Cardinality::Repeated | Cardinality::Counted { layout: CountLayout::Repeated, .. }
        )
    }

    /// 整个字段的值是否符合这一项
    pub fn accepts(&self, value: &FieldValue) -> bool {
        if self.is_list() {
            match value {
                FieldValue::List(items) => items.iter().all(|item| accepts(&self.codec, item)),
                _ => false,
            }
        } else {
            accepts(&self.codec, value)
        }
    }
}

// -------------------------------------------------------------------
// 路径
// -------------------------------------------------------------------

/// 路径中的一段：签名 + 可选的下标（列表元素 / 结构成员 / 数组元素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PathSegment {
    pub signature: Signature,
    pub index: Option<usize>,
}

/// 字段路径，文本形式如 `MAST[1]/DATA`、`KWDA[0]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldPath(pub Vec<PathSegment>);

impl FieldPath {
    pub fn new(signature: Signature) -> Self {
        FieldPath(vec![PathSegment { signature, index: None }])
    }

    /// 为最后一段设置下标
    pub fn at(mut self, index: usize) -> Self {
        if let Some(last) = self.0.last_mut() {
            last.index = Some(index);
        }
        self
    }

    /// 追加一段（进入子对象）
    pub fn then(mut self, signature: Signature) -> Self {
        self.0.push(PathSegment { signature, index: None });
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

impl From<&[u8; 4]> for FieldPath {
    fn from(signature: &[u8; 4]) -> Self {
        FieldPath::new(Signature(*signature))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment.signature)?;
            if let Some(index) = segment.index {
                write!(f, "[{}]", index)?;
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = EspError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EspError::InvalidArgument(format!("invalid field path: {}", s));
        let segments = s
            .split('/')
            .map(|part| {
                let (name, index) = match part.split_once('[') {
                    Some((name, rest)) => {
                        let digits = rest.strip_suffix(']').ok_or_else(invalid)?;
                        (name, Some(digits.parse::<usize>().map_err(|_| invalid())?))
                    }
                    None => (part, None),
                };
                let bytes: [u8; 4] = name.as_bytes().try_into().map_err(|_| invalid())?;
                Ok(PathSegment { signature: Signature(bytes), index })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FieldPath(segments))
    }
}

// -------------------------------------------------------------------
// 解析
// -------------------------------------------------------------------

/// 解析记录体（已解压）
pub fn parse_record(record_type: RecordType, body: &[u8], ctx: &ParseContext) -> Result<RecordFields> {
    let chunks = Subrecord::parse_all(body)?;
    parse_chunks(record_type, &chunks, ctx)
}

pub fn parse_chunks(record_type: RecordType, chunks: &[Subrecord], ctx: &ParseContext) -> Result<RecordFields> {
    let mut pos = 0;
    parse_entries(record_type.signature(), record_type.schema().entries, chunks, &mut pos, ctx, false)
}

fn parse_entries(
    owner: Signature,
    entries: &'static [FieldEntry],
    chunks: &[Subrecord],
    pos: &mut usize,
    ctx: &ParseContext,
    nested: bool,
) -> Result<RecordFields> {
    let mut fields = RecordFields::new(owner, entries);
    let start = *pos;
    let mut next = 0;

    while let Some(chunk) = chunks.get(*pos) {
        let ahead = (next..entries.len()).find(|&i| entries[i].lead_signature() == chunk.signature);
        let index = match ahead {
            Some(i) => Some(i),
            None if nested => None,
            // 顺序错乱但尚未出现过的项
            None => (0..next).find(|&i| {
                entries[i].lead_signature() == chunk.signature && fields.values[i].is_none()
            }),
        };

        let Some(index) = index else {
            if nested {
                break;
            }
            tracing::trace!(record = %owner, signature = %chunk.signature, "keeping unknown chunk");
            fields.unknown.push(UnknownChunk { anchor: next, chunk: chunk.clone() });
            *pos += 1;
            continue;
        };

        // 子对象的首项再次出现，是下一个实例
        if nested && index == 0 && *pos > start {
            break;
        }

        if index >= next && !ctx.lenient {
            if let Some(missing) = (next..index)
                .find(|&i| entries[i].is_required() && fields.values[i].is_none())
            {
                return Err(EspError::MissingRequiredField {
                    record_type: owner,
                    signature: entries[missing].signature,
                });
            }
        }

        let entry = &entries[index];
        let value = read_entry(entry, chunks, pos, ctx)?;
        fields.values[index] = Some(match (entry.cardinality, fields.values[index].take()) {
            (Cardinality::Repeated, Some(FieldValue::List(mut items))) => {
                items.push(value);
                FieldValue::List(items)
            }
            (Cardinality::Repeated, _) => FieldValue::List(vec![value]),
            _ => value,
        });

        if index >= next {
            next = if entry.cardinality == Cardinality::Repeated { index } else { index + 1 };
        }
    }

    if !ctx.lenient {
        if let Some((entry, _)) = entries
            .iter()
            .zip(&fields.values)
            .find(|(entry, value)| entry.is_required() && value.is_none())
        {
            return Err(EspError::MissingRequiredField { record_type: owner, signature: entry.signature });
        }
    }

    Ok(fields)
}

fn read_entry(entry: &FieldEntry, chunks: &[Subrecord], pos: &mut usize, ctx: &ParseContext) -> Result<FieldValue> {
    let Cardinality::Counted { width, layout, .. } = entry.cardinality else {
        return read_single(entry, chunks, pos, ctx);
    };

    let count_chunk = chunks
        .get(*pos)
        .ok_or_else(|| EspError::malformed(entry.signature, "missing count"))?;
    let expected = decode_count(width, count_chunk)?;
    *pos += 1;

    let (value, actual) = match layout {
        CountLayout::Packed => {
            let value = match chunks.get(*pos) {
                Some(chunk) if chunk.signature == entry.signature => {
                    *pos += 1;
                    decode(&entry.codec, chunk, ctx)?
                }
                _ => default_value(&entry.codec),
            };
            let actual = value.element_count();
            (value, actual)
        }
        CountLayout::Repeated => {
            let mut items = Vec::new();
            while chunks.get(*pos).is_some_and(|c| c.signature == entry.signature) {
                items.push(read_single(entry, chunks, pos, ctx)?);
            }
            let actual = items.len();
            (FieldValue::List(items), actual)
        }
    };

    if actual != expected {
        return Err(EspError::CountMismatch { signature: entry.signature, expected, actual });
    }
    Ok(value)
}

fn read_single(entry: &FieldEntry, chunks: &[Subrecord], pos: &mut usize, ctx: &ParseContext) -> Result<FieldValue> {
    match entry.codec {
        Codec::Object(sub) => Ok(FieldValue::Object(parse_entries(entry.signature, sub, chunks, pos, ctx, true)?)),
        codec => {
            let chunk = chunks
                .get(*pos)
                .ok_or_else(|| EspError::malformed(entry.signature, "unexpected end of record"))?;
            let value = decode(&codec, chunk, ctx)?;
            *pos += 1;
            Ok(value)
        }
    }
}

// -------------------------------------------------------------------
// 写入
// -------------------------------------------------------------------

/// 按字段表顺序编码记录体（未压缩）
pub fn write_record(fields: &RecordFields, encoder: &dyn FormIdEncoder) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_fields(fields, &mut out, encoder)?;
    Ok(out)
}

fn write_fields(fields: &RecordFields, out: &mut Vec<u8>, encoder: &dyn FormIdEncoder) -> Result<()> {
    let mut unknown = fields.unknown.iter().peekable();

    for (i, (entry, value)) in fields.entries.iter().zip(&fields.values).enumerate() {
        while let Some(chunk) = unknown.next_if(|u| u.anchor <= i) {
            chunk.chunk.write(out);
        }
        if let Some(value) = value {
            write_entry(entry, value, out, encoder)?;
        }
    }
    for chunk in unknown {
        chunk.chunk.write(out);
    }
    Ok(())
}

fn write_entry(entry: &FieldEntry, value: &FieldValue, out: &mut Vec<u8>, encoder: &dyn FormIdEncoder) -> Result<()> {
    match (entry.cardinality, value) {
        (Cardinality::Counted { count, width, layout: CountLayout::Packed }, value) => {
            let n = value.element_count();
            write_chunk(out, count, &encode_count(width, count, n)?);
            if n > 0 {
                write_single(entry, value, out, encoder)?;
            }
        }
        (Cardinality::Counted { count, width, layout: CountLayout::Repeated }, FieldValue::List(items)) => {
            write_chunk(out, count, &encode_count(width, count, items.len())?);
            for item in items {
                write_single(entry, item, out, encoder)?;
            }
        }
        (Cardinality::Repeated, FieldValue::List(items)) => {
            for item in items {
                write_single(entry, item, out, encoder)?;
            }
        }
        (Cardinality::Repeated | Cardinality::Counted { .. }, _) => {
            return Err(EspError::FieldTypeMismatch(entry.signature.to_string()));
        }
        _ => write_single(entry, value, out, encoder)?,
    }
    Ok(())
}

fn write_single(entry: &FieldEntry, value: &FieldValue, out: &mut Vec<u8>, encoder: &dyn FormIdEncoder) -> Result<()> {
    match (entry.codec, value) {
        (Codec::Object(_), FieldValue::Object(sub)) => write_fields(sub, out, encoder),
        (Codec::Object(_), _) => Err(EspError::FieldTypeMismatch(entry.signature.to_string())),
        (codec, value) => {
            let payload = encode(&codec, entry.signature, value, encoder)?;
            write_chunk(out, entry.signature, &payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(out: &mut Vec<u8>, sig: &[u8; 4], data: &[u8]) {
        write_chunk(out, Signature(*sig), data);
    }

    fn keym_body(keyword_count: u32, keywords: &[u32]) -> Vec<u8> {
        let mut body = Vec::new();
        chunk(&mut body, b"EDID", b"TestKey\0");
        chunk(&mut body, b"OBND", &[1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0]);
        chunk(&mut body, b"KSIZ", &keyword_count.to_le_bytes());
        let kwda: Vec<u8> = keywords.iter().flat_map(|k| k.to_le_bytes()).collect();
        chunk(&mut body, b"KWDA", &kwda);
        let mut data = 10u32.to_le_bytes().to_vec();
        data.extend_from_slice(&0.5f32.to_le_bytes());
        chunk(&mut body, b"DATA", &data);
        body
    }

    #[test]
    fn test_keym_roundtrip() {
        let body = keym_body(2, &[0x0001_0001, 0x0001_0002]);
        let fields = parse_record(RecordType::Keym, &body, &ParseContext::default()).unwrap();

        assert_eq!(fields.editor_id(), Some("TestKey"));
        assert_eq!(fields.value(Signature(*b"KWDA")).map(FieldValue::element_count), Some(2));
        assert_eq!(write_record(&fields, &RawFormIds).unwrap(), body);
    }

    #[test]
    fn test_count_mismatch() {
        let body = keym_body(3, &[1, 2]);
        let err = parse_record(RecordType::Keym, &body, &ParseContext::default()).unwrap_err();
        assert!(matches!(err, EspError::CountMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_missing_required_field() {
        let mut body = Vec::new();
        chunk(&mut body, b"EDID", b"NoBounds\0");
        chunk(&mut body, b"FULL", b"Key\0");
        let err = parse_record(RecordType::Keym, &body, &ParseContext::default()).unwrap_err();
        assert!(matches!(
            err,
            EspError::MissingRequiredField { signature, .. } if signature == Signature(*b"OBND")
        ));

        // 已删除记录不检查
        let lenient = ParseContext { lenient: true, ..Default::default() };
        assert!(parse_record(RecordType::Keym, &body, &lenient).is_ok());
    }

    #[test]
    fn test_unknown_chunk_keeps_position() {
        let mut body = Vec::new();
        chunk(&mut body, b"EDID", b"Global\0");
        chunk(&mut body, b"XNAM", &[9, 9]);
        chunk(&mut body, b"FNAM", b"f");
        chunk(&mut body, b"FLTV", &2.0f32.to_le_bytes());
        chunk(&mut body, b"ZZZZ", &[]);

        let fields = parse_record(RecordType::Glob, &body, &ParseContext::default()).unwrap();
        assert_eq!(fields.unknown_chunks().len(), 2);
        assert_eq!(write_record(&fields, &RawFormIds).unwrap(), body);
    }

    #[test]
    fn test_irregular_edid_roundtrip() {
        let mut body = Vec::new();
        // 没有终止符
        chunk(&mut body, b"EDID", b"Abc");
        chunk(&mut body, b"FNAM", b"f");
        chunk(&mut body, b"FLTV", &2.0f32.to_le_bytes());

        let fields = parse_record(RecordType::Glob, &body, &ParseContext::default()).unwrap();
        assert_eq!(fields.editor_id(), Some("Abc"));
        assert_eq!(write_record(&fields, &RawFormIds).unwrap(), body);
    }

    #[test]
    fn test_opaque_data_detection() {
        let body = keym_body(1, &[0x0100_0001]);
        let mut fields = parse_record(RecordType::Keym, &body, &ParseContext::default()).unwrap();
        assert!(!fields.has_opaque_data());

        fields.set_path(&b"VMAD".into(), FieldValue::Bytes(vec![5, 0, 2, 0])).unwrap();
        assert!(fields.has_opaque_data());

        let mut generic = Vec::new();
        chunk(&mut generic, b"EDID", b"Npc\0");
        chunk(&mut generic, b"RNAM", &0x0000_0800u32.to_le_bytes());
        let fields = parse_record(RecordType::from_signature(Signature(*b"NPC_")), &generic, &ParseContext::default()).unwrap();
        assert!(fields.has_opaque_data());
    }

    #[test]
    fn test_write_uses_schema_order() {
        let mut body = Vec::new();
        chunk(&mut body, b"FLTV", &2.0f32.to_le_bytes());
        chunk(&mut body, b"EDID", b"Late\0");
        chunk(&mut body, b"FNAM", b"s");

        // FLTV 先出现时 FNAM 已被跳过，必填检查失败
        assert!(parse_record(RecordType::Glob, &body, &ParseContext::default()).is_err());

        let lenient = ParseContext { lenient: true, ..Default::default() };
        let fields = parse_record(RecordType::Glob, &body, &lenient).unwrap();
        let written = write_record(&fields, &RawFormIds).unwrap();
        let chunks = Subrecord::parse_all(&written).unwrap();
        let order: Vec<String> = chunks.iter().map(|c| c.signature.to_string()).collect();
        assert_eq!(order, vec!["EDID", "FNAM", "FLTV"]);
    }

    #[test]
    fn test_header_masters_and_paths() {
        let mut body = Vec::new();
        let mut hedr = 1.7f32.to_le_bytes().to_vec();
        hedr.extend_from_slice(&3u32.to_le_bytes());
        hedr.extend_from_slice(&0x800u32.to_le_bytes());
        chunk(&mut body, b"HEDR", &hedr);
        chunk(&mut body, b"MAST", b"Skyrim.esm\0");
        chunk(&mut body, b"DATA", &0u64.to_le_bytes());
        chunk(&mut body, b"MAST", b"Update.esm\0");
        chunk(&mut body, b"DATA", &0u64.to_le_bytes());
        chunk(&mut body, b"INTV", &1u32.to_le_bytes());

        let mut fields = parse_record(RecordType::Tes4, &body, &ParseContext::default()).unwrap();
        let path: FieldPath = "MAST[1]/MAST".parse().unwrap();
        assert_eq!(path.to_string(), "MAST[1]/MAST");
        assert_eq!(fields.get_path(&path).unwrap().and_then(|v| v.as_str().map(String::from)), Some("Update.esm".into()));
        assert_eq!(write_record(&fields, &RawFormIds).unwrap(), body);

        let count: FieldPath = "HEDR[1]".parse().unwrap();
        assert_eq!(fields.get_path(&count).unwrap(), Some(FieldValue::Scalar(Scalar::U32(3))));
        fields.set_path(&count, FieldValue::Scalar(Scalar::U32(4))).unwrap();
        assert!(fields.set_path(&count, FieldValue::Scalar(Scalar::F32(4.0))).is_err());

        fields.delete_path(&"MAST[0]".parse().unwrap()).unwrap();
        assert_eq!(fields.value(Signature(*b"MAST")).map(FieldValue::element_count), Some(1));
    }

    #[test]
    fn test_set_and_delete_fields() {
        let mut fields = RecordFields::for_type(RecordType::Glob);
        assert!(fields.value(Signature(*b"FLTV")).is_some());
        assert!(fields.editor_id().is_none());

        fields.set_path(&b"EDID".into(), FieldValue::string("gTest")).unwrap();
        assert_eq!(fields.editor_id(), Some("gTest"));

        let err = fields.set_path(&b"EDID".into(), FieldValue::Bytes(vec![1])).unwrap_err();
        assert!(matches!(err, EspError::FieldTypeMismatch(_)));

        let err = fields.get_path(&b"NOPE".into()).unwrap_err();
        assert!(matches!(err, EspError::UnknownField { .. }));

        fields.set_path(&b"FLTV".into(), FieldValue::Struct(vec![Scalar::F32(3.5)])).unwrap();
        fields.delete_path(&b"FLTV".into()).unwrap();
        assert_eq!(fields.value(Signature(*b"FLTV")), Some(&FieldValue::Struct(vec![Scalar::F32(0.0)])));

        fields.delete_path(&b"EDID".into()).unwrap();
        assert!(fields.editor_id().is_none());
    }

    #[test]
    fn test_visit_form_refs_reports_paths() {
        let body = keym_body(2, &[0x0100_0001, 0x0100_0002]);
        let mut fields = parse_record(RecordType::Keym, &body, &ParseContext::default()).unwrap();
        fields.set_path(&b"YNAM".into(), FieldValue::Struct(vec![Scalar::FormId(FormRef::Local(LocalRef(7)))])).unwrap();

        let mut seen = Vec::new();
        fields.visit_form_refs_mut(&mut |path, form| {
            seen.push(path.to_string());
            *form = FormRef::Local(LocalRef(0x42));
        });
        assert_eq!(seen, vec!["YNAM[0]", "KWDA[0]", "KWDA[1]"]);

        let mut count = 0;
        fields.visit_form_refs(&mut |form| {
            assert_eq!(*form, FormRef::Local(LocalRef(0x42)));
            count += 1;
        });
        assert_eq!(count, 3);
    }

    #[test]
    fn test_path_parse_errors() {
        assert!("MAST[x]".parse::<FieldPath>().is_err());
        assert!("TOOLONG".parse::<FieldPath>().is_err());
        assert!("KWDA[2".parse::<FieldPath>().is_err());
    }
}
