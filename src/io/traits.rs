/// IO 抽象层 - trait 定义
///
/// 只负责字节的读写，不负责解析或序列化。

use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

use crate::utils::Result;

/// 插件文件原始数据
#[derive(Debug)]
pub enum RawEspData {
    /// 读入内存的字节
    Owned(Vec<u8>),
    /// 内存映射文件（零拷贝）
    Mapped(Mmap),
}

impl RawEspData {
    pub fn bytes(&self) -> &[u8] {
        match self {
            RawEspData::Owned(bytes) => bytes,
            RawEspData::Mapped(mmap) => mmap,
        }
    }
}

impl Deref for RawEspData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

/// 插件文件读取 trait
pub trait EspReader: Send + Sync {
    /// 读取插件文件的原始数据
    fn read(&self, path: &Path) -> Result<RawEspData>;

    /// 文件是否存在
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// 插件文件写入 trait
///
/// 实现必须保证写入是全有或全无的：失败时不能留下不完整的目标文件。
pub trait EspWriter: Send + Sync {
    fn write(&self, data: &[u8], path: &Path) -> Result<()>;
}
