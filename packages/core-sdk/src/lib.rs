pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod resolver;
pub mod server;
pub mod telemetry;
pub mod usage;
pub mod vault;

pub use error::{LlmError, Result};
pub use llm::LlmService;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::adapters::{AdapterRegistry, ProviderAdapter};
    pub use crate::config::Settings;
    pub use crate::db;
    pub use crate::error::{ConfigInvariant, ErrorKind, LlmError};
    pub use crate::llm::{self, LlmService, ServiceOptions};
    pub use crate::models;
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::vault::CredentialVault;
}
