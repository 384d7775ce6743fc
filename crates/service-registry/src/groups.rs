//! Service groups and the group-default merge

use crate::error::{Error, Result};
use crate::models::{ServiceDefinition, ServiceGroup, validate_name};
use futures::lock::Mutex;
use process_kernel::Tuples;
use std::collections::HashMap;
use tracing::{debug, info};

/// Resolve an instance's flags and environment
///
/// Starts from the service's own flags and walks `groups` left to right; a
/// group's key is applied only if neither the service nor an earlier group
/// set it.
pub fn merge_defaults(service: &ServiceDefinition, groups: &[ServiceGroup]) -> (Tuples, Tuples) {
    let mut flags = service.flags.clone();
    let mut env = Tuples::new();
    for group in groups {
        flags.merge_missing(&group.flags);
        env.merge_missing(&group.env);
    }
    (flags, env)
}

/// Registry of service groups keyed by name
#[derive(Debug, Default)]
pub struct Groups {
    groups: Mutex<HashMap<String, ServiceGroup>>,
}

impl Groups {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every group, sorted by name
    pub async fn list(&self) -> Vec<ServiceGroup> {
        let mut groups: Vec<_> = self.groups.lock().await.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Look up a group
    pub async fn get(&self, name: &str) -> Result<ServiceGroup> {
        self.groups
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("group {name:?}")))
    }

    /// Returns true if the group exists
    pub async fn contains(&self, name: &str) -> bool {
        self.groups.lock().await.contains_key(name)
    }

    /// Create an empty group
    pub async fn add_for_name(&self, name: &str) -> Result<ServiceGroup> {
        validate_name(name)?;
        let mut groups = self.groups.lock().await;
        if groups.contains_key(name) {
            return Err(Error::already_exists(format!("group {name:?}")));
        }
        let group = ServiceGroup::new(name);
        groups.insert(name.to_string(), group.clone());
        info!(group = name, "group added");
        Ok(group)
    }

    /// Delete a group
    pub async fn remove_by_name(&self, name: &str) -> Result<ServiceGroup> {
        let removed = self
            .groups
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("group {name:?}")))?;
        info!(group = name, "group removed");
        Ok(removed)
    }

    /// Replace a group's flags
    pub async fn set_flags(&self, name: &str, flags: Tuples) -> Result<ServiceGroup> {
        self.replace(name, |group| &mut group.flags, flags).await
    }

    /// Replace a group's environment
    pub async fn set_env(&self, name: &str, env: Tuples) -> Result<ServiceGroup> {
        self.replace(name, |group| &mut group.env, env).await
    }

    async fn replace<F>(&self, name: &str, slot: F, value: Tuples) -> Result<ServiceGroup>
    where
        F: FnOnce(&mut ServiceGroup) -> &mut Tuples,
    {
        let mut groups = self.groups.lock().await;
        let current = groups
            .get(name)
            .ok_or_else(|| Error::not_found(format!("group {name:?}")))?;
        let mut updated = current.clone();
        let target = slot(&mut updated);
        if *target == value {
            return Err(Error::not_modified(format!("group {name:?}")));
        }
        *target = value;
        groups.insert(name.to_string(), updated.clone());
        debug!(group = name, "group updated");
        Ok(updated)
    }

    /// Resolve flags and environment for `service` from its groups
    ///
    /// Groups the service names but that do not exist are skipped.
    pub async fn resolve(&self, service: &ServiceDefinition) -> (Tuples, Tuples) {
        let groups = self.groups.lock().await;
        let members: Vec<ServiceGroup> = service
            .groups
            .iter()
            .filter_map(|name| {
                let group = groups.get(name).cloned();
                if group.is_none() {
                    debug!(service = %service.name, group = %name, "unknown group skipped");
                }
                group
            })
            .collect();
        merge_defaults(service, &members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuples(pairs: &[(&str, &str)]) -> Tuples {
        let mut t = Tuples::new();
        for (k, v) in pairs {
            t.set_string_for_key(k, *v).unwrap();
        }
        t
    }

    #[test]
    fn test_merge_first_writer_wins() {
        let mut service = ServiceDefinition::new("web", "web");
        service.flags = tuples(&[("port", "80")]);
        let base = ServiceGroup {
            name: "base".to_string(),
            flags: tuples(&[("port", "1"), ("log", "info")]),
            env: tuples(&[("LANG", "C")]),
        };
        let debug = ServiceGroup {
            name: "debug".to_string(),
            flags: tuples(&[("log", "debug"), ("trace", "")]),
            env: tuples(&[("LANG", "en"), ("RUST_LOG", "debug")]),
        };

        let (flags, env) = merge_defaults(&service, &[base, debug]);
        assert_eq!(flags, tuples(&[("port", "80"), ("log", "info"), ("trace", "")]));
        assert_eq!(env, tuples(&[("LANG", "C"), ("RUST_LOG", "debug")]));
        assert_eq!(service.flags.len(), 1);
    }

    #[smol_potat::test]
    async fn test_group_lifecycle() {
        let groups = Groups::new();
        groups.add_for_name("base").await.unwrap();
        assert!(groups.add_for_name("base").await.is_err());
        assert!(groups.add_for_name("-bad").await.unwrap_err().is_bad_parameter());

        let flags = tuples(&[("port", "80")]);
        groups.set_flags("base", flags.clone()).await.unwrap();
        assert!(groups.set_flags("base", flags).await.unwrap_err().is_not_modified());
        groups.set_env("base", tuples(&[("A", "1")])).await.unwrap();
        assert!(groups.set_env("nope", Tuples::new()).await.unwrap_err().is_not_found());

        let group = groups.get("base").await.unwrap();
        assert_eq!(group.flags.get("port"), Some("80"));
        assert_eq!(group.env.get("A"), Some("1"));

        groups.remove_by_name("base").await.unwrap();
        assert!(groups.list().await.is_empty());
        assert!(groups.remove_by_name("base").await.unwrap_err().is_not_found());
    }

    #[smol_potat::test]
    async fn test_resolve_skips_unknown_groups() {
        let groups = Groups::new();
        groups.add_for_name("base").await.unwrap();
        groups.set_flags("base", tuples(&[("x", "1")])).await.unwrap();
        let mut service = ServiceDefinition::new("web", "web");
        service.groups = vec!["ghost".to_string(), "base".to_string()];
        let (flags, env) = groups.resolve(&service).await;
        assert_eq!(flags.get("x"), Some("1"));
        assert!(env.is_empty());
    }
}
