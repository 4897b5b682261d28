/// 插件文件 IO 实现
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::Mmap;

use super::traits::{EspReader, EspWriter, RawEspData};
use crate::utils::{EspError, Result};

/// 默认读取器（内存映射）
#[derive(Debug, Clone, Default)]
pub struct DefaultEspReader;

impl EspReader for DefaultEspReader {
    fn read(&self, path: &Path) -> Result<RawEspData> {
        let file = std::fs::File::open(path)?;
        // 空文件无法映射
        if file.metadata()?.len() == 0 {
            return Ok(RawEspData::Owned(Vec::new()));
        }
        // SAFETY: 映射期间文件不应被其他进程截断；映射只读
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(RawEspData::Mapped(mmap))
    }
}

/// 默认写入器：先写临时文件再重命名
#[derive(Debug, Clone, Default)]
pub struct DefaultEspWriter;

impl EspWriter for DefaultEspWriter {
    fn write(&self, data: &[u8], path: &Path) -> Result<()> {
        // 确保父目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_name = path
            .file_name()
            .ok_or_else(|| EspError::InvalidArgument(format!("not a file path: {}", path.display())))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);

        // 写入或重命名失败都不留下临时文件
        let written = std::fs::write(&temp_path, data).and_then(|()| std::fs::rename(&temp_path, path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

/// 内存中的文件系统，读写同一份数据
#[derive(Debug, Default)]
pub struct MemoryEspIo {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryEspIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), bytes);
        }
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().ok()?.get(path).cloned()
    }
}

impl EspReader for MemoryEspIo {
    fn read(&self, path: &Path) -> Result<RawEspData> {
        self.get(path).map(RawEspData::Owned).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string()).into()
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }
}

impl EspWriter for MemoryEspIo {
    fn write(&self, data: &[u8], path: &Path) -> Result<()> {
        self.insert(path, data.to_vec());
        Ok(())
    }
}

impl<T: EspReader + ?Sized> EspReader for std::sync::Arc<T> {
    fn read(&self, path: &Path) -> Result<RawEspData> {
        (**self).read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
}

impl<T: EspWriter + ?Sized> EspWriter for std::sync::Arc<T> {
    fn write(&self, data: &[u8], path: &Path) -> Result<()> {
        (**self).write(data, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_esp_reader() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test_esp_reader.esp");

        let test_data = b"TES4\x00\x00\x00\x00";
        std::fs::write(&test_file, test_data).unwrap();

        let result = DefaultEspReader.read(&test_file).unwrap();
        assert_eq!(result.bytes(), test_data);
    }

    #[test]
    fn test_reader_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("empty.esp");
        std::fs::write(&test_file, b"").unwrap();

        assert!(DefaultEspReader.read(&test_file).unwrap().is_empty());
    }

    #[test]
    fn test_writer_creates_parent_dirs_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("nested").join("subdir").join("test.esp");

        DefaultEspWriter.write(&[1, 2, 3, 4], &test_file).unwrap();

        assert_eq!(std::fs::read(&test_file).unwrap(), vec![1, 2, 3, 4]);
        assert!(!test_file.with_file_name("test.esp.tmp").exists());
    }

    #[test]
    fn test_failed_write_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // 目标是非空目录，重命名必然失败
        let target = dir.path().join("Blocked.esp");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        assert!(DefaultEspWriter.write(&[1, 2, 3], &target).is_err());
        assert!(!dir.path().join("Blocked.esp.tmp").exists());
        assert!(target.join("keep").exists());
    }

    #[test]
    fn test_memory_io() {
        let io = MemoryEspIo::new();
        let path = Path::new("Data/A.esp");
        assert!(!io.exists(path));
        io.write(&[9, 9], path).unwrap();
        assert_eq!(io.read(path).unwrap().bytes(), &[9, 9]);
    }
}
