/// IO 抽象层模块
///
/// 插件文件的读写通过 trait 注入集合，便于测试和替换 IO 实现（如内存 IO）。
///
/// - **traits**: 定义 Reader/Writer trait 接口
/// - **esp_io**: 默认实现（内存映射读取、原子写入）与内存实现
///
/// ```rust,ignore
/// use esp_collection::io::{DefaultEspReader, EspReader};
///
/// let data = DefaultEspReader.read(Path::new("example.esp"))?;
/// ```
pub mod traits;
pub mod esp_io;

pub use traits::{EspReader, EspWriter, RawEspData};
pub use esp_io::{DefaultEspReader, DefaultEspWriter, MemoryEspIo};
