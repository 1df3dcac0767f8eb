pub mod settings;

pub use settings::{AlarmImportConfig, OutputConfig, PlcConfig, ServerConfig, Settings, TagImportConfig};
