pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, validate_config};
pub use schema::{
    ConverterSettings, PoolConfig, SandboxSettings, DEFAULT_MAX_CONCURRENT, DEFAULT_PRIORITY,
};
