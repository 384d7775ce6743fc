//! Process definitions accepted by the kernel

use crate::tuples::Tuples;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies a kernel process and the service it belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    /// Process id (0 = any)
    pub id: u32,
    /// Service id (0 = any)
    pub sid: u32,
}

/// What to run: an executable under the kernel root plus its arguments,
/// identity and environment
///
/// Paths are interpreted relative to the kernel root; `user` and `group`
/// accept names or numeric ids and default to the kernel's own identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessDefinition {
    /// Service name, for display and logs
    pub name: String,
    /// Service id the process belongs to
    pub sid: u32,
    /// Executable path relative to the kernel root
    pub path: String,
    /// Working directory; empty means the kernel root
    pub cwd: String,
    /// Positional arguments, passed after the flags
    pub args: Vec<String>,
    /// User name or uid to run as
    pub user: String,
    /// Group name or gid to run as
    pub group: String,
    /// Whether the owning service is enabled
    pub enabled: bool,
    /// Flags rendered as `-key=value` before the arguments
    pub flags: Tuples,
    /// Extra environment variables
    pub env: Tuples,
    /// Run-time ceiling; zero means unbounded
    pub timeout: Duration,
}

impl ProcessDefinition {
    /// Create a definition for an executable path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
            ..Default::default()
        }
    }

    /// Create a builder for this definition (for chaining)
    pub fn builder(path: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder(Self::new(path))
    }

    /// Deadline for the process, if any
    pub fn deadline(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Full argument vector: rendered flags followed by positional arguments
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.flags.flags();
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Builder wrapper for more ergonomic definition construction
pub struct ProcessDefinitionBuilder(ProcessDefinition);

impl ProcessDefinitionBuilder {
    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.0.name = name.into();
        self
    }

    /// Set the owning service id
    pub fn sid(mut self, sid: u32) -> Self {
        self.0.sid = sid;
        self
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.0.cwd = cwd.into();
        self
    }

    /// Set the user to run as
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.0.user = user.into();
        self
    }

    /// Set the group to run as
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.0.group = group.into();
        self
    }

    /// Set the flags
    pub fn flags(mut self, flags: Tuples) -> Self {
        self.0.flags = flags;
        self
    }

    /// Set the environment
    pub fn env(mut self, env: Tuples) -> Self {
        self.0.env = env;
        self
    }

    /// Set the run-time ceiling
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.0.timeout = timeout;
        self
    }

    /// Build the definition
    pub fn build(self) -> ProcessDefinition {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let mut flags = Tuples::new();
        flags.set_string_for_key("port", "80").unwrap();
        let def = ProcessDefinition::builder("bin/web")
            .name("web")
            .sid(12)
            .arg("serve")
            .args(["--once"])
            .cwd("data")
            .user("nobody")
            .flags(flags)
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(def.path, "bin/web");
        assert_eq!(def.sid, 12);
        assert_eq!(def.argv(), vec!["-port=80", "serve", "--once"]);
        assert_eq!(def.deadline(), Some(Duration::from_secs(5)));
        assert!(def.enabled);
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        assert_eq!(ProcessDefinition::new("x").deadline(), None);
    }

    #[test]
    fn test_definition_json_defaults() {
        let def: ProcessDefinition = serde_json::from_str(r#"{"path":"tool","args":["a"]}"#).unwrap();
        assert_eq!(def.path, "tool");
        assert_eq!(def.args, vec!["a"]);
        assert!(def.user.is_empty());
        assert!(def.flags.is_empty());
    }
}
