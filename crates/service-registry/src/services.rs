//! Service registry keyed by service id

use crate::error::{Error, Result};
use crate::models::{ServiceDefinition, ServiceField, ServiceMode, name_for_path, validate_name};
use futures::lock::Mutex;
use process_kernel::IdAllocator;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Identity and working directory given to services the registry creates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDefaults {
    /// Working directory
    pub cwd: String,
    /// User name or uid
    pub user: String,
    /// Group name or gid
    pub group: String,
}

struct Inner {
    services: HashMap<u32, ServiceDefinition>,
    allocator: IdAllocator,
    /// Services disabled because their executable went missing
    discovery_disabled: HashSet<u32>,
}

impl Inner {
    fn name_taken(&self, name: &str, except: u32) -> bool {
        self.services
            .values()
            .any(|s| s.sid != except && s.name == name)
    }

    fn find_by_path(&mut self, path: &str) -> Option<&mut ServiceDefinition> {
        self.services.values_mut().find(|s| s.path == path)
    }

    fn allocate(&mut self) -> Result<u32> {
        let services = &self.services;
        match self.allocator.allocate_with(|sid| services.contains_key(&sid)) {
            0 => Err(Error::internal("service id space exhausted")),
            sid => Ok(sid),
        }
    }

    /// Build a service for `path` with a fresh sid and a unique derived name
    fn create_for_path(&mut self, path: &str, defaults: &ServiceDefaults) -> Result<ServiceDefinition> {
        let sid = self.allocate()?;
        let name = name_for_path(path, |candidate| self.name_taken(candidate, 0));
        Ok(ServiceDefinition {
            sid,
            cwd: defaults.cwd.clone(),
            user: defaults.user.clone(),
            group: defaults.group.clone(),
            ..ServiceDefinition::new(name, path)
        })
    }
}

/// Desired-state registry of services
///
/// All accessors return copies; updates replace whole definitions.
pub struct Services {
    inner: Mutex<Inner>,
    defaults: ServiceDefaults,
}

impl Services {
    /// Create an empty registry
    pub fn new(defaults: ServiceDefaults) -> Self {
        Self::with_allocator(defaults, IdAllocator::new())
    }

    /// Create an empty registry drawing service ids from `allocator`
    pub fn with_allocator(defaults: ServiceDefaults, allocator: IdAllocator) -> Self {
        Self {
            inner: Mutex::new(Inner {
                services: HashMap::new(),
                allocator,
                discovery_disabled: HashSet::new(),
            }),
            defaults,
        }
    }

    /// Defaults applied to created services
    pub fn defaults(&self) -> &ServiceDefaults {
        &self.defaults
    }

    /// Snapshot of every service, sorted by name
    pub async fn list(&self) -> Vec<ServiceDefinition> {
        let mut services: Vec<_> = self.inner.lock().await.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Look up a service by id
    pub async fn get(&self, sid: u32) -> Result<ServiceDefinition> {
        self.inner
            .lock()
            .await
            .services
            .get(&sid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service {sid}")))
    }

    /// Look up a service by name
    pub async fn get_by_name(&self, name: &str) -> Result<ServiceDefinition> {
        self.inner
            .lock()
            .await
            .services
            .values()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service {name:?}")))
    }

    /// Register a definition, assigning a sid when it has none
    pub async fn add(&self, mut def: ServiceDefinition) -> Result<ServiceDefinition> {
        validate_name(&def.name)?;
        if def.path.is_empty() {
            return Err(Error::bad_parameter("service path is empty"));
        }
        let mut inner = self.inner.lock().await;
        if inner.name_taken(&def.name, 0) {
            return Err(Error::already_exists(format!("service {:?}", def.name)));
        }
        if def.sid == 0 {
            def.sid = inner.allocate()?;
        } else if inner.services.contains_key(&def.sid) {
            return Err(Error::already_exists(format!("service {}", def.sid)));
        }
        inner.services.insert(def.sid, def.clone());
        info!(sid = def.sid, name = %def.name, path = %def.path, "service added");
        Ok(def)
    }

    /// Register an enabled manual service for an executable path
    pub async fn add_for_path(&self, path: &str, groups: &[String]) -> Result<ServiceDefinition> {
        if path.is_empty() {
            return Err(Error::bad_parameter("service path is empty"));
        }
        for group in groups {
            validate_name(group)?;
        }
        let mut inner = self.inner.lock().await;
        if inner.find_by_path(path).is_some() {
            return Err(Error::already_exists(format!("service for {path:?}")));
        }
        let mut def = inner.create_for_path(path, &self.defaults)?;
        def.groups = groups.to_vec();
        def.enabled = true;
        inner.services.insert(def.sid, def.clone());
        info!(sid = def.sid, name = %def.name, path, "service added");
        Ok(def)
    }

    /// Delete a service by name
    pub async fn remove_by_name(&self, name: &str) -> Result<ServiceDefinition> {
        let mut inner = self.inner.lock().await;
        let sid = inner
            .services
            .values()
            .find(|s| s.name == name)
            .map(|s| s.sid)
            .ok_or_else(|| Error::not_found(format!("service {name:?}")))?;
        let removed = inner
            .services
            .remove(&sid)
            .ok_or_else(|| Error::not_found(format!("service {name:?}")))?;
        inner.discovery_disabled.remove(&sid);
        info!(sid, name, "service removed");
        Ok(removed)
    }

    /// Apply the named fields of `def` to the service with the same sid
    ///
    /// The stored definition is replaced by an updated copy. Fails with
    /// NotModified when none of the named fields differ.
    pub async fn update(
        &self,
        def: &ServiceDefinition,
        fields: &[ServiceField],
    ) -> Result<ServiceDefinition> {
        if fields.is_empty() {
            return Err(Error::bad_parameter("no fields to update"));
        }
        let mut inner = self.inner.lock().await;
        let current = inner
            .services
            .get(&def.sid)
            .ok_or_else(|| Error::not_found(format!("service {}", def.sid)))?;

        let mut updated = current.clone();
        let mut changed = false;
        for field in fields {
            changed |= updated.apply_field(*field, def);
        }
        if !changed {
            return Err(Error::not_modified(format!("service {:?}", updated.name)));
        }
        let toggled = updated.enabled != current.enabled;

        if updated.name != current.name {
            validate_name(&updated.name)?;
            if inner.name_taken(&updated.name, updated.sid) {
                return Err(Error::already_exists(format!("service {:?}", updated.name)));
            }
        }
        for group in &updated.groups {
            validate_name(group)?;
        }

        if toggled {
            inner.discovery_disabled.remove(&updated.sid);
        }
        debug!(sid = updated.sid, ?fields, "service updated");
        inner.services.insert(updated.sid, updated.clone());
        Ok(updated)
    }

    /// Reconcile the registry against discovered executable paths
    ///
    /// Unknown paths get a new disabled MANUAL service. Services whose path
    /// was not seen are disabled, never deleted. An AUTO service is
    /// re-enabled when its path returns, unless an update changed its
    /// `enabled` flag in the meantime. Returns whether anything changed.
    ///
    /// Either every new service is registered or, on error, none is and the
    /// registry is left as it was.
    pub async fn modify(&self, paths: &[String]) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        let mut fresh: Vec<&str> = Vec::new();
        for path in paths {
            if inner.find_by_path(path).is_none() && !fresh.contains(&path.as_str()) {
                fresh.push(path);
            }
        }

        let mut created = Vec::with_capacity(fresh.len());
        for path in &fresh {
            match inner.create_for_path(path, &self.defaults) {
                Ok(def) => {
                    // Registered now so later names and sids stay unique
                    inner.services.insert(def.sid, def.clone());
                    created.push(def);
                }
                Err(e) => {
                    for def in &created {
                        inner.services.remove(&def.sid);
                    }
                    return Err(e);
                }
            }
        }
        for def in &created {
            info!(sid = def.sid, name = %def.name, path = %def.path, "service discovered");
        }
        let mut changed = !created.is_empty();

        let Inner {
            services,
            discovery_disabled,
            ..
        } = &mut *inner;
        let seen: HashSet<&str> = paths.iter().map(String::as_str).collect();
        for service in services.values_mut() {
            if seen.contains(service.path.as_str()) {
                let disabled_by_pass = discovery_disabled.remove(&service.sid);
                if disabled_by_pass && service.mode == ServiceMode::Auto && !service.enabled {
                    service.enabled = true;
                    changed = true;
                    info!(sid = service.sid, name = %service.name, "service re-enabled");
                }
            } else if service.enabled {
                service.enabled = false;
                discovery_disabled.insert(service.sid);
                changed = true;
                info!(sid = service.sid, name = %service.name, "service disabled, executable missing");
            }
        }

        Ok(changed)
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Services {
        Services::with_allocator(
            ServiceDefaults {
                cwd: "/home/ops".to_string(),
                user: "1000".to_string(),
                group: "1000".to_string(),
            },
            IdAllocator::seeded(3),
        )
    }

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[smol_potat::test]
    async fn test_modify_is_idempotent() {
        let services = registry();
        let list = paths(&["web", "worker"]);
        assert!(services.modify(&list).await.unwrap());
        assert!(!services.modify(&list).await.unwrap());

        let all = services.list().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| !s.enabled && s.mode == ServiceMode::Manual));
        assert!(all.iter().all(|s| s.sid != 0 && s.cwd == "/home/ops" && s.user == "1000"));
    }

    #[smol_potat::test]
    async fn test_missing_path_disables_not_deletes() {
        let services = registry();
        services.modify(&paths(&["web", "worker"])).await.unwrap();
        let web = services.get_by_name("web").await.unwrap();
        let mut enabled = web.clone();
        enabled.enabled = true;
        services.update(&enabled, &[ServiceField::Enabled]).await.unwrap();

        assert!(services.modify(&paths(&["worker"])).await.unwrap());
        let web = services.get(web.sid).await.unwrap();
        assert!(!web.enabled);
        assert_eq!(services.list().await.len(), 2);

        // Manual services stay disabled when the executable returns
        assert!(!services.modify(&paths(&["web", "worker"])).await.unwrap());
        assert!(!services.get(web.sid).await.unwrap().enabled);
    }

    #[smol_potat::test]
    async fn test_auto_service_reenabled_when_seen() {
        let services = registry();
        let mut def = ServiceDefinition::new("web", "web");
        def.mode = ServiceMode::Auto;
        def.enabled = true;
        let def = services.add(def).await.unwrap();

        assert!(services.modify(&[]).await.unwrap());
        assert!(!services.get(def.sid).await.unwrap().enabled);
        assert!(services.modify(&paths(&["web"])).await.unwrap());
        assert!(services.get(def.sid).await.unwrap().enabled);
    }

    #[smol_potat::test]
    async fn test_operator_disable_survives_discovery() {
        let services = registry();
        let mut def = ServiceDefinition::new("web", "web");
        def.mode = ServiceMode::Auto;
        def.enabled = true;
        let def = services.add(def).await.unwrap();
        assert!(!services.modify(&paths(&["web"])).await.unwrap());

        let mut off = def.clone();
        off.enabled = false;
        services.update(&off, &[ServiceField::Enabled]).await.unwrap();
        assert!(!services.modify(&paths(&["web"])).await.unwrap());
        assert!(!services.get(def.sid).await.unwrap().enabled);

        // Disabled by a pass, then disabled again by the operator while missing
        services.update(&def, &[ServiceField::Enabled]).await.unwrap();
        assert!(services.modify(&[]).await.unwrap());
        services.update(&def, &[ServiceField::Enabled]).await.unwrap();
        services.update(&off, &[ServiceField::Enabled]).await.unwrap();
        assert!(!services.modify(&paths(&["web"])).await.unwrap());
        assert!(!services.get(def.sid).await.unwrap().enabled);
    }

    #[smol_potat::test]
    async fn test_failed_pass_registers_nothing() {
        let services = Services::with_allocator(
            ServiceDefaults::default(),
            IdAllocator::seeded(4).with_capacity(2),
        );
        services.modify(&paths(&["a"])).await.unwrap();
        let a = services.get_by_name("a").await.unwrap();
        let mut enabled = a.clone();
        enabled.enabled = true;
        services.update(&enabled, &[ServiceField::Enabled]).await.unwrap();

        let err = services.modify(&paths(&["b", "c"])).await.unwrap_err();
        assert!(matches!(err, Error::InternalError { .. }));
        let names: Vec<_> = services.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a"]);
        assert!(services.get(a.sid).await.unwrap().enabled);

        // Duplicate paths in one pass yield one service
        assert!(services.modify(&paths(&["a", "b", "b"])).await.unwrap());
        assert_eq!(services.list().await.len(), 2);
    }

    #[smol_potat::test]
    async fn test_discovered_names_are_unique() {
        let services = registry();
        services.modify(&paths(&["a/tool", "b/tool", "c/tool"])).await.unwrap();
        let names: Vec<_> = services.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["tool", "tool-2", "tool-3"]);
    }

    #[smol_potat::test]
    async fn test_update_rules() {
        let services = registry();
        let def = services.add_for_path("web", &[]).await.unwrap();
        assert!(def.enabled);

        assert!(services.update(&def, &[]).await.unwrap_err().is_bad_parameter());
        assert!(
            services
                .update(&def, &[ServiceField::Enabled])
                .await
                .unwrap_err()
                .is_not_modified()
        );

        let mut ghost = def.clone();
        ghost.sid = def.sid.wrapping_add(1000);
        assert!(services.update(&ghost, &[ServiceField::Name]).await.unwrap_err().is_not_found());

        let mut renamed = def.clone();
        renamed.name = "frontend".to_string();
        renamed.user = "root".to_string();
        let updated = services.update(&renamed, &[ServiceField::Name]).await.unwrap();
        assert_eq!(updated.name, "frontend");
        assert_eq!(updated.user, def.user);

        let mut invalid = updated.clone();
        invalid.name = "9lives".to_string();
        assert!(services.update(&invalid, &[ServiceField::Name]).await.unwrap_err().is_bad_parameter());
        assert_eq!(services.get(def.sid).await.unwrap().name, "frontend");
    }

    #[smol_potat::test]
    async fn test_add_and_remove() {
        let services = registry();
        services.add_for_path("bin/web", &["base".to_string()]).await.unwrap();
        assert!(matches!(
            services.add_for_path("bin/web", &[]).await,
            Err(Error::AlreadyExists { .. })
        ));
        assert!(matches!(
            services.add(ServiceDefinition::new("web", "other")).await,
            Err(Error::AlreadyExists { .. })
        ));
        assert_eq!(services.get_by_name("web").await.unwrap().groups, vec!["base"]);

        services.remove_by_name("web").await.unwrap();
        assert!(services.get_by_name("web").await.unwrap_err().is_not_found());
        assert!(services.remove_by_name("web").await.unwrap_err().is_not_found());
    }
}
