//! 集成测试共用的工具
//!
//! `PluginBuilder` 直接按磁盘格式拼字节，不经过库的编码器。

#![allow(dead_code)]

use esp_collection::io::MemoryEspIo;
use esp_collection::{Collection, FieldPath, FieldValue, GameType, RecordId, Scalar};
use std::path::PathBuf;
use std::sync::Arc;

pub const DELETED: u32 = 0x0000_0020;
pub const MASTER_FILE: u32 = 0x0000_0001;

/// 按 Skyrim 格式拼装插件
#[derive(Debug, Clone, Default)]
pub struct PluginBuilder {
    flags: u32,
    masters: Vec<String>,
    author: Option<String>,
    groups: Vec<([u8; 4], Vec<Vec<u8>>)>,
}

impl PluginBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn esm(mut self) -> Self {
        self.flags |= MASTER_FILE;
        self
    }

    pub fn master(mut self, name: &str) -> Self {
        self.masters.push(name.to_string());
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    /// 全局变量：EDID, FNAM, FLTV
    pub fn glob(self, form_id: u32, editor_id: &str, value: f32) -> Self {
        self.glob_with_flags(form_id, editor_id, value, 0)
    }

    pub fn deleted_glob(self, form_id: u32, editor_id: &str, value: f32) -> Self {
        self.glob_with_flags(form_id, editor_id, value, DELETED)
    }

    fn glob_with_flags(self, form_id: u32, editor_id: &str, value: f32, flags: u32) -> Self {
        let mut body = Vec::new();
        chunk(&mut body, b"EDID", &zstring(editor_id));
        chunk(&mut body, b"FNAM", b"f");
        chunk(&mut body, b"FLTV", &value.to_le_bytes());
        self.raw_record(b"GLOB", form_id, flags, body)
    }

    pub fn keyword(self, form_id: u32, editor_id: &str) -> Self {
        let mut body = Vec::new();
        chunk(&mut body, b"EDID", &zstring(editor_id));
        self.raw_record(b"KYWD", form_id, 0, body)
    }

    /// 钥匙：带关键字列表和拾取音效引用
    pub fn key(self, form_id: u32, editor_id: &str, keywords: &[u32], pickup_sound: Option<u32>) -> Self {
        let mut body = Vec::new();
        chunk(&mut body, b"EDID", &zstring(editor_id));
        chunk(&mut body, b"OBND", &[0u8; 12]);
        if let Some(sound) = pickup_sound {
            chunk(&mut body, b"YNAM", &sound.to_le_bytes());
        }
        if !keywords.is_empty() {
            chunk(&mut body, b"KSIZ", &(keywords.len() as u32).to_le_bytes());
            let packed: Vec<u8> = keywords.iter().flat_map(|k| k.to_le_bytes()).collect();
            chunk(&mut body, b"KWDA", &packed);
        }
        let mut data = Vec::new();
        data.extend_from_slice(&5u32.to_le_bytes());
        data.extend_from_slice(&0.5f32.to_le_bytes());
        chunk(&mut body, b"DATA", &data);
        self.raw_record(b"KEYM", form_id, 0, body)
    }

    /// 任意记录，放入与签名同名的顶级组
    pub fn raw_record(mut self, signature: &[u8; 4], form_id: u32, flags: u32, body: Vec<u8>) -> Self {
        let bytes = record(signature, form_id, flags, &body);
        match self.groups.iter_mut().find(|(label, _)| label == signature) {
            Some((_, records)) => records.push(bytes),
            None => self.groups.push((*signature, vec![bytes])),
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let record_count: usize = self.groups.iter().map(|(_, records)| records.len() + 1).sum();

        let mut header = Vec::new();
        let mut hedr = Vec::new();
        hedr.extend_from_slice(&1.7f32.to_le_bytes());
        hedr.extend_from_slice(&(record_count as u32).to_le_bytes());
        hedr.extend_from_slice(&0x900u32.to_le_bytes());
        chunk(&mut header, b"HEDR", &hedr);
        if let Some(author) = &self.author {
            chunk(&mut header, b"CNAM", &zstring(author));
        }
        for master in &self.masters {
            chunk(&mut header, b"MAST", &zstring(master));
            chunk(&mut header, b"DATA", &0u64.to_le_bytes());
        }

        let mut out = record(b"TES4", 0, self.flags, &header);
        for (label, records) in &self.groups {
            let size: usize = 24 + records.iter().map(Vec::len).sum::<usize>();
            out.extend_from_slice(b"GRUP");
            out.extend_from_slice(&(size as u32).to_le_bytes());
            out.extend_from_slice(label);
            out.extend_from_slice(&0i32.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            for bytes in records {
                out.extend_from_slice(bytes);
            }
        }
        out
    }
}

pub fn zstring(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

pub fn chunk(out: &mut Vec<u8>, signature: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(signature);
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
}

pub fn record(signature: &[u8; 4], form_id: u32, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(signature);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&form_id.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&44u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn data_dir() -> PathBuf {
    PathBuf::from("Data")
}

/// 内存文件系统上的集合
pub fn memory_collection(files: &[(&str, Vec<u8>)]) -> (Collection, Arc<MemoryEspIo>) {
    let io = Arc::new(MemoryEspIo::new());
    for (name, bytes) in files {
        io.insert(data_dir().join(name), bytes.clone());
    }
    let collection = Collection::new(data_dir(), GameType::Skyrim)
        .with_reader(io.clone())
        .with_writer(io.clone());
    (collection, io)
}

/// 全局变量的值
pub fn glob_value(collection: &Collection, record: RecordId) -> f32 {
    match collection.get_field(record, &FieldPath::from(b"FLTV")).unwrap() {
        Some(FieldValue::Struct(values)) => match values[0] {
            Scalar::F32(v) => v,
            ref other => panic!("unexpected FLTV scalar {:?}", other),
        },
        other => panic!("unexpected FLTV value {:?}", other),
    }
}

pub fn set_glob_value(collection: &mut Collection, record: RecordId, value: f32) {
    collection
        .set_field(record, &FieldPath::from(b"FLTV"), FieldValue::Struct(vec![Scalar::F32(value)]))
        .unwrap();
}
