pub mod db;
pub mod description;
pub mod error;
pub mod llm;
pub mod models;
pub mod node;
pub mod prompt;
pub mod server;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::db;
    pub use crate::description;
    pub use crate::error::{NodeError, NodeResult};
    pub use crate::llm;
    pub use crate::models;
    pub use crate::node;
    pub use crate::prompt;
    pub use crate::server;
    pub use crate::telemetry;
}
