//! Project layer
//!
//! Everything the language server needs to know about the Gradle project
//! before and while it runs:
//!
//! - **classpath**: classpath assembly from the project model and build outputs
//! - **index_cache**: persisted workspace-symbol index keyed by classpath hash
//! - **workspace**: launch, handshake and initial indexing
//! - **watcher**: classpath reload after build outputs change

pub mod classpath;
pub mod index_cache;
pub mod watcher;
pub mod workspace;

pub use classpath::{ClasspathAssembler, ModuleInfo, ProjectModelProvider, StaticProjectModel};
pub use index_cache::{CacheError, CacheStats, IndexCache};
pub use watcher::{BuildWatcher, QuietPeriod};
pub use workspace::{ServerHandle, SetupReport, WorkspaceSetup};
