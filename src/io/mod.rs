//! I/O layer - Process supervision primitives and byte transport
//!
//! - **Transport**: bidirectional byte exchange with the language server
//! - **Process**: child process lifecycle with stdio wiring and stderr draining
//!
//! Nothing here knows about JSON-RPC or Kotlin; those layers sit on top.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, LaunchCommand, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MockTransport, MockTransportHandle, StdioTransport, Transport};
