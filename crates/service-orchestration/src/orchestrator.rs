//! Reconciliation loop, instance convergence and the management surface

use crate::config::OrchestratorConfig;
use crate::instances::Instances;
use crate::ticker::{SmolTicker, Ticker};
use crate::{Error, Result};
use async_channel::{Receiver, Sender};
use futures::lock::Mutex;
use futures_lite::future;
use process_kernel::{EventFilter, EventReceiver, IdAllocator, KernelApi, ProcessEvent, Tuples};
use service_registry::{
    Groups, ServiceDefinition, ServiceField, ServiceGroup, ServiceInstance, ServiceMode, Services,
};
use smol::{Task, Timer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before the next tick given the outcome of this one
///
/// A tick that changed the registry halves the interval; an unchanged or
/// failed tick waits the full interval.
pub fn next_delay(outcome: &Result<bool>, interval: Duration) -> Duration {
    match outcome {
        Ok(true) => interval / 2,
        Ok(false) | Err(_) => interval,
    }
}

struct Shared {
    config: OrchestratorConfig,
    kernel: Arc<dyn KernelApi>,
    ticker: Arc<dyn Ticker>,
    services: Services,
    groups: Groups,
    instances: Mutex<Instances>,
    observers: std::sync::Mutex<Vec<Sender<ProcessEvent>>>,
}

impl Shared {
    /// Kernel `executables` call bounded by the discovery deadline
    async fn discover_services(&self, recursive: bool) -> Result<Vec<String>> {
        let timeout = self.config.discovery_timeout;
        let call = async { Some(self.kernel.executables(recursive).await) };
        let deadline = async {
            Timer::after(timeout).await;
            None
        };
        match future::or(call, deadline).await {
            Some(paths) => Ok(paths?),
            None => Err(process_kernel::Error::unavailable(format!(
                "executable discovery exceeded {timeout:?}"
            ))
            .into()),
        }
    }

    /// Discover executables and feed them into the registry
    async fn reconcile(&self) -> Result<bool> {
        let paths = self.discover_services(self.config.recursive).await?;
        Ok(self.services.modify(&paths).await?)
    }

    /// Move running instances toward each service's policy
    async fn converge(&self) {
        for service in self.services.list().await {
            if !service.is_runnable() {
                let live = self.instances.lock().await.live_for(service.sid);
                for instance in live {
                    info!(service = %service.name, instance = instance.id, "stopping instance of inactive service");
                    if let Err(e) = self.stop_instance(instance.id).await {
                        warn!(instance = instance.id, error = %e, "failed to stop instance");
                    }
                }
                continue;
            }

            if service.mode != ServiceMode::Auto {
                continue;
            }
            let due = {
                let instances = self.instances.lock().await;
                let wanted = usize::try_from(service.instance_count).unwrap_or(usize::MAX);
                instances.live_count(service.sid) < wanted
                    && instances.idle_elapsed(service.sid, service.idle_time)
            };
            if due {
                match self.start_instance(&service, 0).await {
                    Ok(instance) => {
                        info!(service = %service.name, instance = instance.id, "auto-started instance")
                    }
                    Err(e) => warn!(service = %service.name, error = %e, "auto-start failed"),
                }
            }
        }
    }

    async fn start_instance(&self, service: &ServiceDefinition, id: u32) -> Result<ServiceInstance> {
        if !service.enabled {
            return Err(Error::BadParameter(format!(
                "service {:?} is disabled",
                service.name
            )));
        }
        if service.instance_count == 0 {
            return Err(Error::BadParameter(format!(
                "service {:?} has an instance count of 0",
                service.name
            )));
        }

        let (flags, env) = self.groups.resolve(service).await;

        // Held across process creation so the event forwarder cannot see the
        // process before its instance exists
        let mut instances = self.instances.lock().await;
        let wanted = usize::try_from(service.instance_count).unwrap_or(usize::MAX);
        if instances.live_count(service.sid) >= wanted {
            return Err(Error::BadParameter(format!(
                "service {:?} already runs {} instance(s)",
                service.name, service.instance_count
            )));
        }
        let requested = id;
        let id = instances.claim(requested)?;
        let def = service.process_definition(flags.clone(), env.clone());
        let process_id = match self.kernel.create_process(def).await {
            Ok(process_id) => process_id,
            Err(e) => {
                if requested != 0 {
                    instances.unclaim(requested);
                }
                return Err(e.into());
            }
        };

        let instance = ServiceInstance::new(id, process_id, service, flags, env);
        instances.insert(instance.clone());
        info!(service = %service.name, instance = id, process = process_id, "instance started");
        Ok(instance)
    }

    async fn stop_instance(&self, id: u32) -> Result<ServiceInstance> {
        let instance = self
            .instances
            .lock()
            .await
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
        if !instance.is_live() {
            return Err(
                service_registry::Error::not_modified(format!("instance {id} already stopped"))
                    .into(),
            );
        }

        match self.kernel.stop_process(instance.process_id).await {
            Ok(()) => {}
            // The forwarder already recorded the exit and released the process
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let records = self.kernel.processes(instance.process_id, 0).await?;
        let updated = {
            let mut instances = self.instances.lock().await;
            if let Some(record) = records.first() {
                instances.apply(record);
            }
            instances.get(id).unwrap_or(instance)
        };
        if !updated.is_live() {
            self.release_process(updated.process_id).await;
        }
        info!(instance = id, "instance stopped");
        Ok(updated)
    }

    async fn release_process(&self, process_id: u32) {
        if let Err(e) = self.kernel.forget_process(process_id).await {
            debug!(process = process_id, error = %e, "process already released");
        }
    }

    /// Update instance state from a kernel event and pass it on
    async fn observe(&self, event: &ProcessEvent) {
        let updated = self.instances.lock().await.apply(&event.record);
        match updated {
            Some(instance) if event.is_terminal() => {
                info!(
                    instance = instance.id,
                    service = %instance.service,
                    exit_code = ?instance.exit_code,
                    error = ?instance.error,
                    "instance exited"
                );
                self.release_process(event.id()).await;
            }
            Some(_) => {}
            None => debug!(process = event.id(), "event for unmanaged process"),
        }

        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

/// Configures and starts an [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    kernel: Arc<dyn KernelApi>,
    ticker: Arc<dyn Ticker>,
    services: Option<Services>,
    instance_allocator: Option<IdAllocator>,
}

impl OrchestratorBuilder {
    /// Replace the wall-clock ticker
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = ticker;
        self
    }

    /// Start from an existing service registry
    pub fn services(mut self, services: Services) -> Self {
        self.services = Some(services);
        self
    }

    /// Draw instance ids from `allocator`
    pub fn instance_allocator(mut self, allocator: IdAllocator) -> Self {
        self.instance_allocator = Some(allocator);
        self
    }

    /// Subscribe to the kernel and launch the background tasks
    pub async fn start(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let events = self.kernel.stream_events(EventFilter::all()).await?;

        let services = self
            .services
            .unwrap_or_else(|| Services::new(self.config.service_defaults()));
        let instances = match self.instance_allocator {
            Some(allocator) => Instances::with_allocator(self.config.retain_stopped, allocator),
            None => Instances::new(self.config.retain_stopped),
        };

        let shared = Arc::new(Shared {
            config: self.config,
            kernel: self.kernel,
            ticker: self.ticker,
            services,
            groups: Groups::new(),
            instances: Mutex::new(instances),
            observers: std::sync::Mutex::new(Vec::new()),
        });

        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let reconciler = smol::spawn(reconcile_loop(shared.clone(), stop_rx.clone()));
        let forwarder = smol::spawn(forward_events(shared.clone(), events, stop_rx));
        info!(
            root = %shared.config.root.display(),
            interval = ?shared.config.interval,
            "orchestrator started"
        );

        Ok(Orchestrator {
            shared,
            stop_tx,
            tasks: Mutex::new(vec![reconciler, forwarder]),
            closed: AtomicBool::new(false),
        })
    }
}

/// Top-level supervisor
///
/// Owns the service and group registries and the instance table, and drives
/// a kernel through [`KernelApi`].
pub struct Orchestrator {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
    tasks: Mutex<Vec<Task<()>>>,
    closed: AtomicBool,
}

impl Orchestrator {
    /// Builder for an orchestrator on top of `kernel`
    pub fn builder(config: OrchestratorConfig, kernel: Arc<dyn KernelApi>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            kernel,
            ticker: Arc::new(SmolTicker),
            services: None,
            instance_allocator: None,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Service registry
    pub fn services(&self) -> &Services {
        &self.shared.services
    }

    /// Group registry
    pub fn groups(&self) -> &Groups {
        &self.shared.groups
    }

    /// Check that the kernel answers
    pub async fn ping(&self) -> Result<()> {
        Ok(self.shared.kernel.ping().await?)
    }

    /// Run one reconciliation pass now
    pub async fn reconcile(&self) -> Result<bool> {
        self.shared.reconcile().await
    }

    /// Snapshot of every service
    pub async fn list_services(&self) -> Vec<ServiceDefinition> {
        self.shared.services.list().await
    }

    /// Executables currently under the kernel root
    pub async fn list_executables(&self) -> Result<Vec<String>> {
        self.shared.discover_services(self.shared.config.recursive).await
    }

    /// Snapshot of every group
    pub async fn list_groups(&self) -> Vec<ServiceGroup> {
        self.shared.groups.list().await
    }

    /// Live and retained stopped instances
    pub async fn list_instances(&self) -> Vec<ServiceInstance> {
        self.shared.instances.lock().await.list()
    }

    async fn ensure_groups(&self, groups: &[String]) -> Result<()> {
        for group in groups {
            if !self.shared.groups.contains(group).await {
                return Err(service_registry::Error::not_found(format!("group {group:?}")).into());
            }
        }
        Ok(())
    }

    /// Register an enabled manual service for an executable under the root
    pub async fn add_service_for_path(
        &self,
        path: &str,
        groups: &[String],
    ) -> Result<ServiceDefinition> {
        self.ensure_groups(groups).await?;
        let executables = self.shared.discover_services(true).await?;
        if !executables.iter().any(|p| p == path) {
            return Err(Error::BadParameter(format!(
                "{path:?} is not an executable under the kernel root"
            )));
        }
        Ok(self.shared.services.add_for_path(path, groups).await?)
    }

    /// Create an empty group
    pub async fn add_group_for_name(&self, name: &str) -> Result<ServiceGroup> {
        Ok(self.shared.groups.add_for_name(name).await?)
    }

    /// Stop a service's instances and delete it
    pub async fn remove_service_for_name(&self, name: &str) -> Result<ServiceDefinition> {
        let service = self.shared.services.get_by_name(name).await?;
        let live = self.shared.instances.lock().await.live_for(service.sid);
        for instance in live {
            self.shared.stop_instance(instance.id).await?;
        }
        Ok(self.shared.services.remove_by_name(name).await?)
    }

    /// Delete a group; services naming it skip it from then on
    pub async fn remove_group_for_name(&self, name: &str) -> Result<ServiceGroup> {
        Ok(self.shared.groups.remove_by_name(name).await?)
    }

    /// Reserve an instance id for a later [`start_instance`](Self::start_instance)
    pub async fn get_instance_id(&self) -> Result<u32> {
        self.shared.instances.lock().await.reserve()
    }

    /// Start an instance of the named service
    ///
    /// `id` is 0 for a fresh id, or one returned by
    /// [`get_instance_id`](Self::get_instance_id).
    pub async fn start_instance(&self, service_name: &str, id: u32) -> Result<ServiceInstance> {
        let service = self.shared.services.get_by_name(service_name).await?;
        self.shared.start_instance(&service, id).await
    }

    /// Stop an instance and return its final state
    pub async fn stop_instance(&self, id: u32) -> Result<ServiceInstance> {
        self.shared.stop_instance(id).await
    }

    /// Apply the named fields of `def` to the stored service
    pub async fn update_service(
        &self,
        def: &ServiceDefinition,
        fields: &[ServiceField],
    ) -> Result<ServiceDefinition> {
        Ok(self.shared.services.update(def, fields).await?)
    }

    /// Replace a service's flags
    pub async fn set_service_flags(&self, name: &str, flags: Tuples) -> Result<ServiceDefinition> {
        let mut service = self.shared.services.get_by_name(name).await?;
        service.flags = flags;
        self.update_service(&service, &[ServiceField::Flags]).await
    }

    /// Replace a service's group list; every group must exist
    pub async fn set_service_groups(
        &self,
        name: &str,
        groups: Vec<String>,
    ) -> Result<ServiceDefinition> {
        self.ensure_groups(&groups).await?;
        let mut service = self.shared.services.get_by_name(name).await?;
        service.groups = groups;
        self.update_service(&service, &[ServiceField::Groups]).await
    }

    /// Replace a group's flags
    pub async fn set_group_flags(&self, name: &str, flags: Tuples) -> Result<ServiceGroup> {
        Ok(self.shared.groups.set_flags(name, flags).await?)
    }

    /// Replace a group's environment
    pub async fn set_group_env(&self, name: &str, env: Tuples) -> Result<ServiceGroup> {
        Ok(self.shared.groups.set_env(name, env).await?)
    }

    /// Receive every kernel event after the instance table has seen it
    pub fn stream_events(&self) -> Result<Receiver<ProcessEvent>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(process_kernel::Error::unavailable("orchestrator is closed").into());
        }
        let (tx, rx) = async_channel::unbounded();
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    /// Stop the loop and the event subscription
    ///
    /// Running instances are left to the kernel. Calling `close` again is a
    /// no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_tx.close();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.await;
        }
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("orchestrator closed");
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.shared.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn reconcile_loop(shared: Arc<Shared>, stop_rx: Receiver<()>) {
    let interval = shared.config.interval;
    loop {
        if stop_rx.is_closed() {
            break;
        }

        let outcome = shared.reconcile().await;
        match &outcome {
            Ok(changed) => debug!(changed, "reconciliation finished"),
            Err(e) => warn!(error = %e, "reconciliation failed"),
        }
        shared.converge().await;

        let delay = next_delay(&outcome, interval);
        debug!(?delay, "next reconciliation scheduled");
        let stop = async {
            let _ = stop_rx.recv().await;
            true
        };
        let sleep = async {
            shared.ticker.sleep(delay).await;
            false
        };
        if future::or(stop, sleep).await {
            break;
        }
    }
    debug!("reconciliation loop stopped");
}

async fn forward_events(shared: Arc<Shared>, events: EventReceiver, stop_rx: Receiver<()>) {
    loop {
        let next = async { events.recv().await.ok() };
        let stop = async {
            let _ = stop_rx.recv().await;
            None
        };
        match future::or(stop, next).await {
            Some(event) => shared.observe(&event).await,
            None => break,
        }
    }
    debug!("event forwarder stopped");
}
