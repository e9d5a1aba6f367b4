//! # Quest Runner Collection Execution Engine
//!
//! The core engine: the task graph builder ([`graph`]), the DAG scheduler
//! ([`scheduler`]), the script execution context and variable scope stack
//! ([`context`], [`scope`], [`variables`]), and the pre-run validator
//! ([`validator`], [`collection_validator`]). Concrete transports, auth
//! schemes, and value providers are external collaborators, defined as
//! traits in `questrunner-plugin` and implemented by sibling crates
//! (`questrunner-http`, `questrunner-auth`, `questrunner-vault`).

pub mod collection_validator;
pub mod context;
pub mod cookie;
pub mod error;
pub mod graph;
pub mod model;
pub mod scheduler;
pub mod scope;
pub mod script_engine;
pub mod script_kind;
pub mod validator;
pub mod variables;

pub use collection_validator::CollectionValidator;
pub use context::{
    AbortHandle, EnvironmentSpec, ExecutionContext, ExecutionContextBuilder, ExecutionOptions,
    ExecutionRecord, HistoryFilter, ProxyOptions, RunResult, RuntimeOptions, SharedContext,
    SslOptions, TestResult, TimeoutOptions,
};
pub use error::{Error, Result};
pub use graph::TaskGraph;
pub use model::{Collection, FolderItem, Item, RequestItem};
pub use scheduler::{RunEvent, Scheduler};
pub use script_kind::ScriptKind;
