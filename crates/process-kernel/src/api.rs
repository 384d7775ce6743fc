//! Control surface for a kernel, local or remote

use crate::definition::ProcessDefinition;
use crate::error::Result;
use crate::event::{EventFilter, ProcessRecord};
use crate::kernel::{EventReceiver, Kernel};
use async_trait::async_trait;

/// Operations a supervisor needs from a kernel
///
/// [`Kernel`] implements this in-process. A client for a kernel running in
/// another process implements the same trait over its transport.
#[async_trait]
pub trait KernelApi: Send + Sync + 'static {
    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Validate and register a process; it starts in the background
    async fn create_process(&self, def: ProcessDefinition) -> Result<u32>;

    /// Start a NEW process immediately
    async fn run_process(&self, id: u32) -> Result<()>;

    /// Stop a process, returning once it has fully stopped
    async fn stop_process(&self, id: u32) -> Result<()>;

    /// Drop a STOPPED process from the table
    async fn forget_process(&self, id: u32) -> Result<()>;

    /// Snapshot of processes by id and service id (0 matches any)
    async fn processes(&self, id: u32, sid: u32) -> Result<Vec<ProcessRecord>>;

    /// Executable files under the kernel root
    async fn executables(&self, recursive: bool) -> Result<Vec<String>>;

    /// Subscribe to process events
    async fn stream_events(&self, filter: EventFilter) -> Result<EventReceiver>;
}

#[async_trait]
impl KernelApi for Kernel {
    async fn ping(&self) -> Result<()> {
        Kernel::ping(self)
    }

    async fn create_process(&self, def: ProcessDefinition) -> Result<u32> {
        Kernel::create_process(self, &def).await
    }

    async fn run_process(&self, id: u32) -> Result<()> {
        Kernel::run_process(self, id).await
    }

    async fn stop_process(&self, id: u32) -> Result<()> {
        Kernel::stop_process(self, id).await
    }

    async fn forget_process(&self, id: u32) -> Result<()> {
        Kernel::forget_process(self, id).await
    }

    async fn processes(&self, id: u32, sid: u32) -> Result<Vec<ProcessRecord>> {
        Ok(Kernel::processes(self, id, sid).await)
    }

    async fn executables(&self, recursive: bool) -> Result<Vec<String>> {
        Kernel::executables(self, recursive).await
    }

    async fn stream_events(&self, filter: EventFilter) -> Result<EventReceiver> {
        Kernel::stream_events(self, filter)
    }
}
