//! Process kernel
//!
//! Spawns and tracks OS child processes for a supervisor. Executables must
//! live under a single root directory; each process can run as another user
//! and group, is bound to an optional deadline, and reports its output and
//! termination as a stream of [`ProcessEvent`]s.
//!
//! ```no_run
//! use process_kernel::{EventFilter, Kernel, ProcessDefinition};
//!
//! # fn main() -> process_kernel::Result<()> {
//! smol::block_on(async {
//!     let kernel = Kernel::new("/usr/local/libexec/services")?;
//!     let events = kernel.stream_events(EventFilter::all())?;
//!     let id = kernel.create_process(&ProcessDefinition::new("hello")).await?;
//!     while let Ok(event) = events.recv().await {
//!         if event.id() == id && event.is_terminal() {
//!             break;
//!         }
//!     }
//!     kernel.close().await
//! })
//! # }
//! ```

#![warn(missing_docs)]

pub mod allocator;
pub mod api;
pub mod definition;
pub mod error;
pub mod event;
pub mod kernel;
pub mod process;
pub mod sandbox;
pub mod tuples;

pub use allocator::IdAllocator;
pub use api::KernelApi;
pub use definition::{ProcessDefinition, ProcessDefinitionBuilder, ProcessId};
pub use error::{Error, Result};
pub use event::{EventFilter, LogSource, ProcessEvent, ProcessEventType, ProcessRecord, ProcessState};
pub use kernel::{EventReceiver, Kernel};
pub use process::{Launch, Process};
pub use tuples::Tuples;
