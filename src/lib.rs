pub mod datatypes;
pub mod utils;
pub mod subrecord;
pub mod schema;
pub mod record;
pub mod group;
pub mod formid;
pub mod arena;
pub mod plugin;
pub mod collection;
pub mod conflict;
pub mod diagnostics;
pub mod io;
pub mod debug;

// 重新导出主要结构
pub use collection::Collection;
pub use plugin::{Plugin, PluginId, PluginStats};
pub use record::{Record, RecordId, RecordState};
pub use group::{Group, GroupChild, GroupType};
pub use subrecord::Subrecord;
pub use formid::{FormKey, FormRef, GlobalId, LocalRef};
pub use schema::{FieldPath, FieldValue, RecordFields, RecordType, Scalar};
pub use datatypes::{CreateFlags, GameType, ModFlags, RecordFlags, SaveFlags, Signature};
pub use conflict::{ConflictReport, ReferenceScope, ReferenceUpdate};
pub use diagnostics::{CallbackDiagnostics, Diagnostics, NullDiagnostics, ProgressCallback, StdoutDiagnostics};
pub use utils::{EspError, Result};
pub use debug::EspDebugger;

// 常量定义
pub const SUPPORTED_EXTENSIONS: &[&str] = &["esp", "esm"];
