use thiserror::Error;
use std::path::Path;

use crate::datatypes::Signature;

/// 自定义错误类型
#[derive(Error, Debug)]
pub enum EspError {
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Malformed field {signature}: {reason}")]
    MalformedField { signature: Signature, reason: String },

    #[error("Record {record_type} is missing required field {signature}")]
    MissingRequiredField { record_type: Signature, signature: Signature },

    #[error("Count mismatch for {signature}: expected {expected}, found {actual}")]
    CountMismatch { signature: Signature, expected: usize, actual: usize },

    #[error("Master slot {slot} is not resolvable in {plugin}")]
    UnresolvedMaster { plugin: String, slot: u8 },

    #[error("{master} is not a master of {plugin}")]
    NotAMaster { plugin: String, master: String },

    #[error("Plugin already in collection: {0}")]
    DuplicatePlugin(String),

    #[error("Plugin not loaded: {0}")]
    PluginNotLoaded(String),

    #[error("Handle refers to unloaded data")]
    UseAfterUnload,

    #[error("Plugin is not editable: {0}")]
    ReadOnly(String),

    #[error("Load order is full (at most 255 plugins)")]
    LoadOrderFull,

    #[error("Record {form_id:08X} already exists in {plugin}")]
    DuplicateRecord { plugin: String, form_id: u32 },

    #[error("No free object ids left in {0}")]
    ObjectIdsExhausted(String),

    #[error("Master list of {0} cannot change: it holds uninterpreted data that may contain references")]
    MastersLocked(String),

    #[error("Invalid parent record: {0}")]
    InvalidParent(String),

    #[error("Unknown field {path} for record {record_type}")]
    UnknownField { record_type: Signature, path: String },

    #[error("Value does not match the codec of field {0}")]
    FieldTypeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled by progress callback")]
    Cancelled,

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EspError>;

impl EspError {
    /// 构造字段格式错误
    pub(crate) fn malformed(signature: Signature, reason: impl Into<String>) -> Self {
        EspError::MalformedField { signature, reason: reason.into() }
    }
}

/// 创建文件备份
pub fn create_backup(file_path: &Path) -> Result<std::path::PathBuf> {
    if !file_path.exists() {
        return Err(EspError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "原文件不存在"
        )));
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    let backup_path = file_path.with_extension(format!("{}.bak", timestamp));

    std::fs::copy(file_path, &backup_path)?;

    Ok(backup_path)
}

/// 插件文件名比较（Windows 文件系统不区分大小写）
pub fn same_plugin_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = create_backup(&dir.path().join("missing.esp"));
        assert!(matches!(result, Err(EspError::IoError(_))));
    }

    #[test]
    fn test_backup_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Mod.esp");
        std::fs::write(&path, b"TES4").unwrap();

        let backup = create_backup(&path).unwrap();
        assert!(backup.exists());
        assert_eq!(std::fs::read(backup).unwrap(), b"TES4");
    }

    #[test]
    fn test_plugin_name_case() {
        assert!(same_plugin_name("Skyrim.esm", "skyrim.ESM"));
        assert!(!same_plugin_name("Skyrim.esm", "Update.esm"));
    }

    #[test]
    fn test_error_messages() {
        let err = EspError::CountMismatch {
            signature: Signature(*b"KWDA"),
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "Count mismatch for KWDA: expected 3, found 2");
    }
}
