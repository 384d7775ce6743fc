//! Data models for services, groups and instances

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use process_kernel::{ProcessDefinition, ProcessRecord, ProcessState, Tuples};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Maximum length of a service or group name
pub const MAX_NAME_LEN: usize = 32;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.-]{0,31}$").expect("valid name pattern"));

/// Check a service or group name
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(Error::bad_parameter(format!("invalid name: {name:?}")))
    }
}

/// Derive a valid name from an executable path
///
/// Uses the base filename with unsupported characters replaced by `_`,
/// prefixed with `s` if it does not start with a letter, and suffixed `-2`,
/// `-3`, ... until `taken` accepts it.
pub fn name_for_path(path: &str, taken: impl Fn(&str) -> bool) -> String {
    let base = Path::new(path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut stem: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !stem.starts_with(|c: char| c.is_ascii_alphabetic()) {
        stem.insert(0, 's');
    }
    stem.truncate(MAX_NAME_LEN);

    if !taken(&stem) {
        return stem;
    }
    (2u32..)
        .map(|n| {
            let suffix = format!("-{n}");
            let mut candidate = stem.clone();
            candidate.truncate(MAX_NAME_LEN - suffix.len());
            candidate.push_str(&suffix);
            candidate
        })
        .find(|candidate| !taken(candidate))
        .unwrap_or(stem)
}

/// How the orchestrator treats a service's instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Instances start only on request
    #[default]
    Manual,
    /// The orchestrator keeps `instance_count` instances running
    Auto,
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceMode::Manual => f.write_str("manual"),
            ServiceMode::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for ServiceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(ServiceMode::Manual),
            "auto" => Ok(ServiceMode::Auto),
            _ => Err(Error::bad_parameter(format!("unknown service mode: {s:?}"))),
        }
    }
}

/// Desired state of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefinition {
    /// Service id, assigned by the registry and immutable once set
    pub sid: u32,
    /// Unique name
    pub name: String,
    /// Executable path relative to the kernel root
    pub path: String,
    /// Working directory
    pub cwd: String,
    /// User name or uid
    pub user: String,
    /// Group name or gid
    pub group: String,
    /// Positional arguments
    pub args: Vec<String>,
    /// Groups supplying default flags and environment, in precedence order
    pub groups: Vec<String>,
    /// Instance policy
    pub mode: ServiceMode,
    /// Desired number of instances; 0 disables the service
    pub instance_count: u32,
    /// Run-time ceiling per instance; zero is unbounded
    #[serde(with = "duration_ms")]
    pub run_time: Duration,
    /// Minimum pause between automatic restarts
    #[serde(with = "duration_ms")]
    pub idle_time: Duration,
    /// Service-level flags
    pub flags: Tuples,
    /// Whether instances may run
    pub enabled: bool,
}

impl Default for ServiceDefinition {
    fn default() -> Self {
        Self {
            sid: 0,
            name: String::new(),
            path: String::new(),
            cwd: String::new(),
            user: String::new(),
            group: String::new(),
            args: Vec::new(),
            groups: Vec::new(),
            mode: ServiceMode::Manual,
            instance_count: 1,
            run_time: Duration::ZERO,
            idle_time: Duration::ZERO,
            flags: Tuples::new(),
            enabled: false,
        }
    }
}

impl ServiceDefinition {
    /// Create a disabled manual service
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Returns true if instances may be started
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.instance_count > 0
    }

    /// Kernel definition for one instance with resolved flags and environment
    pub fn process_definition(&self, flags: Tuples, env: Tuples) -> ProcessDefinition {
        ProcessDefinition::builder(self.path.clone())
            .name(self.name.clone())
            .sid(self.sid)
            .cwd(self.cwd.clone())
            .user(self.user.clone())
            .group(self.group.clone())
            .args(self.args.iter().cloned())
            .flags(flags)
            .env(env)
            .timeout(self.run_time)
            .build()
    }

    /// Copy `field` from `other` onto `self`; returns true if it changed
    pub fn apply_field(&mut self, field: ServiceField, other: &ServiceDefinition) -> bool {
        fn assign<T: PartialEq + Clone>(slot: &mut T, value: &T) -> bool {
            if slot == value {
                false
            } else {
                *slot = value.clone();
                true
            }
        }

        match field {
            ServiceField::Enabled => assign(&mut self.enabled, &other.enabled),
            ServiceField::Name => assign(&mut self.name, &other.name),
            ServiceField::Flags => assign(&mut self.flags, &other.flags),
            ServiceField::Groups => assign(&mut self.groups, &other.groups),
            ServiceField::Mode => assign(&mut self.mode, &other.mode),
            ServiceField::InstanceCount => assign(&mut self.instance_count, &other.instance_count),
            ServiceField::RunTime => assign(&mut self.run_time, &other.run_time),
            ServiceField::IdleTime => assign(&mut self.idle_time, &other.idle_time),
            ServiceField::Args => assign(&mut self.args, &other.args),
            ServiceField::Cwd => assign(&mut self.cwd, &other.cwd),
            ServiceField::User => assign(&mut self.user, &other.user),
            ServiceField::Group => assign(&mut self.group, &other.group),
        }
    }
}

/// Field names accepted by a scoped update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceField {
    /// `enabled`
    Enabled,
    /// `name`
    Name,
    /// `flags`
    Flags,
    /// `groups`
    Groups,
    /// `mode`
    Mode,
    /// `instance_count`
    InstanceCount,
    /// `run_time`
    RunTime,
    /// `idle_time`
    IdleTime,
    /// `args`
    Args,
    /// `cwd`
    Cwd,
    /// `user`
    User,
    /// `group`
    Group,
}

impl ServiceField {
    /// Every field, in declaration order
    pub const ALL: [ServiceField; 12] = [
        ServiceField::Enabled,
        ServiceField::Name,
        ServiceField::Flags,
        ServiceField::Groups,
        ServiceField::Mode,
        ServiceField::InstanceCount,
        ServiceField::RunTime,
        ServiceField::IdleTime,
        ServiceField::Args,
        ServiceField::Cwd,
        ServiceField::User,
        ServiceField::Group,
    ];

    /// Wire name of the field
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceField::Enabled => "enabled",
            ServiceField::Name => "name",
            ServiceField::Flags => "flags",
            ServiceField::Groups => "groups",
            ServiceField::Mode => "mode",
            ServiceField::InstanceCount => "instance_count",
            ServiceField::RunTime => "run_time",
            ServiceField::IdleTime => "idle_time",
            ServiceField::Args => "args",
            ServiceField::Cwd => "cwd",
            ServiceField::User => "user",
            ServiceField::Group => "group",
        }
    }
}

impl fmt::Display for ServiceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ServiceField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| Error::bad_parameter(format!("unknown field: {s:?}")))
    }
}

/// Shared defaults for the services that list the group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceGroup {
    /// Unique group name
    pub name: String,
    /// Default flags
    pub flags: Tuples,
    /// Default environment
    pub env: Tuples,
}

impl ServiceGroup {
    /// Create an empty group
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A service definition bound to a kernel process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance id, unique among the orchestrator's instances
    pub id: u32,
    /// Kernel process running the instance
    pub process_id: u32,
    /// Owning service id
    pub sid: u32,
    /// Owning service name at start time
    pub service: String,
    /// Resolved flags (service flags over group defaults)
    pub flags: Tuples,
    /// Resolved environment
    pub env: Tuples,
    /// Lifecycle state
    pub state: ProcessState,
    /// OS pid once running
    pub pid: Option<u32>,
    /// When the instance was requested
    pub created_at: DateTime<Utc>,
    /// When the process spawned
    pub started_at: Option<DateTime<Utc>>,
    /// When the process stopped
    pub stopped_at: Option<DateTime<Utc>>,
    /// Exit code after a normal exit
    pub exit_code: Option<i32>,
    /// Error carried by the terminal event
    pub error: Option<String>,
}

impl ServiceInstance {
    /// Create a NEW instance of `service` backed by kernel process `process_id`
    pub fn new(
        id: u32,
        process_id: u32,
        service: &ServiceDefinition,
        flags: Tuples,
        env: Tuples,
    ) -> Self {
        Self {
            id,
            process_id,
            sid: service.sid,
            service: service.name.clone(),
            flags,
            env,
            state: ProcessState::New,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Returns true until the instance has stopped
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Fold a kernel snapshot into the instance; states never move backwards
    pub fn apply_record(&mut self, record: &ProcessRecord) {
        if record.state < self.state {
            return;
        }
        self.state = record.state;
        self.pid = record.pid.or(self.pid);
        self.started_at = record.started_at.or(self.started_at);
        self.stopped_at = record.stopped_at.or(self.stopped_at);
        self.exit_code = record.exit_code;
        self.error = record.error.clone();
    }
}

/// Serialize durations as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("a.b-c_9").is_ok());
        assert!(validate_name(&"x".repeat(32)).is_ok());
        assert!(validate_name(&"x".repeat(33)).is_err());
        assert!(validate_name("9web").unwrap_err().is_bad_parameter());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_name_for_path() {
        let none = |_: &str| false;
        assert_eq!(name_for_path("bin/web", none), "web");
        assert_eq!(name_for_path("2fast", none), "s2fast");
        assert_eq!(name_for_path("my tool+x", none), "my_tool_x");
        assert_eq!(name_for_path(&"y".repeat(40), none).len(), MAX_NAME_LEN);

        let taken = |n: &str| n == "web" || n == "web-2";
        assert_eq!(name_for_path("other/web", taken), "web-3");

        let long = "z".repeat(40);
        let full = "z".repeat(32);
        let named = name_for_path(&long, |n: &str| n == full);
        assert!(named.ends_with("-2"));
        assert!(validate_name(&named).is_ok());
    }

    #[test]
    fn test_mode_and_field_parsing() {
        assert_eq!("AUTO".parse::<ServiceMode>().unwrap(), ServiceMode::Auto);
        assert!("sometimes".parse::<ServiceMode>().is_err());
        assert_eq!(
            "instance_count".parse::<ServiceField>().unwrap(),
            ServiceField::InstanceCount
        );
        assert!("colour".parse::<ServiceField>().unwrap_err().is_bad_parameter());
        for field in ServiceField::ALL {
            assert_eq!(field.as_str().parse::<ServiceField>().unwrap(), field);
        }
    }

    #[test]
    fn test_apply_field_reports_change() {
        let mut current = ServiceDefinition::new("web", "web");
        let mut wanted = current.clone();
        wanted.enabled = true;
        wanted.user = "nobody".to_string();
        assert!(current.apply_field(ServiceField::Enabled, &wanted));
        assert!(!current.apply_field(ServiceField::Enabled, &wanted));
        assert_eq!(current.user, "");
    }

    #[test]
    fn test_process_definition() {
        let mut def = ServiceDefinition::new("web", "bin/web");
        def.sid = 3;
        def.args = vec!["serve".to_string()];
        def.run_time = Duration::from_secs(9);
        let mut flags = Tuples::new();
        flags.set_string_for_key("port", "80").unwrap();
        let pd = def.process_definition(flags, Tuples::new());
        assert_eq!(pd.sid, 3);
        assert_eq!(pd.name, "web");
        assert_eq!(pd.argv(), vec!["-port=80", "serve"]);
        assert_eq!(pd.deadline(), Some(Duration::from_secs(9)));
    }

    #[test]
    fn test_instance_state_is_monotonic() {
        let def = ServiceDefinition::new("web", "web");
        let mut instance = ServiceInstance::new(5, 5, &def, Tuples::new(), Tuples::new());
        let mut record = ProcessRecord {
            id: 5,
            sid: 0,
            name: "web".to_string(),
            path: PathBuf::from("/srv/web"),
            pid: Some(100),
            state: ProcessState::Stopped,
            started_at: Some(Utc::now()),
            stopped_at: Some(Utc::now()),
            exit_code: Some(0),
            signal: None,
            error: None,
        };
        instance.apply_record(&record);
        assert!(!instance.is_live());
        assert_eq!(instance.exit_code, Some(0));

        record.state = ProcessState::Running;
        instance.apply_record(&record);
        assert_eq!(instance.state, ProcessState::Stopped);
    }

    #[test]
    fn test_definition_json_uses_milliseconds() {
        let mut def = ServiceDefinition::new("web", "web");
        def.idle_time = Duration::from_secs(2);
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["idle_time"], 2000);
        assert_eq!(json["mode"], "manual");
        let back: ServiceDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }
}
