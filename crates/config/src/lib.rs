//! Engine configuration: the typed option table behind
//! `sluice.configget` / `sluice.configset`, and the replicated
//! string-blob configuration store.

use parking_lot::RwLock;
use serde::Serialize;

mod store;
pub use store::{ConfigStore, StoreEntry, INNER_CONFIG_SET_COMMAND};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown config parameter '{0}'")]
    Unknown(String),
    #[error("config parameter '{0}' is not settable at runtime")]
    NotRuntimeSettable(String),
    #[error("invalid value '{value}' for config parameter '{name}'")]
    BadValue { name: String, value: String },
    #[error("missing value for config parameter '{0}'")]
    MissingValue(String),
}

/// A config value is a string, a long, or a double.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    Long(i64),
    Double(f64),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Values {
    plugin_home_dir: String,
    max_executions: usize,
    max_executions_per_registration: usize,
    profile_executions: bool,
    execution_threads: usize,
    execution_max_idle_time_ms: u64,
    send_msg_retries: usize,
}

impl Default for Values {
    fn default() -> Self {
        Values {
            plugin_home_dir: "/usr/lib/sluice/plugins".to_string(),
            max_executions: 1000,
            max_executions_per_registration: 100,
            profile_executions: false,
            execution_threads: 3,
            execution_max_idle_time_ms: 5_000,
            send_msg_retries: 3,
        }
    }
}

/// The recognized option table. Names are matched case-insensitively;
/// unknown names produce an error. Options that size thread pools or
/// locate plugins are load-time only.
#[derive(Debug, Default)]
pub struct Config {
    values: RwLock<Values>,
}

const NAMES: &[&str] = &[
    "PluginHomeDir",
    "MaxExecutions",
    "MaxExecutionsPerRegistration",
    "ProfileExecutions",
    "ExecutionThreads",
    "ExecutionMaxIdleTime",
    "SendMsgRetries",
];

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `name value` pairs passed at module load.
    pub fn apply_load_args(&self, args: &[String]) -> Result<(), Error> {
        let mut it = args.iter();
        while let Some(name) = it.next() {
            let value = it
                .next()
                .ok_or_else(|| Error::MissingValue(name.clone()))?;
            self.set_internal(name, value, false)?;
            tracing::info!(%name, %value, "applied load-time config");
        }
        Ok(())
    }

    pub fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    pub fn get(&self, name: &str) -> Result<Value, Error> {
        let v = self.values.read();
        Ok(match canonical(name)? {
            "PluginHomeDir" => Value::Str(v.plugin_home_dir.clone()),
            "MaxExecutions" => Value::Long(v.max_executions as i64),
            "MaxExecutionsPerRegistration" => {
                Value::Long(v.max_executions_per_registration as i64)
            }
            "ProfileExecutions" => Value::Long(v.profile_executions as i64),
            "ExecutionThreads" => Value::Long(v.execution_threads as i64),
            "ExecutionMaxIdleTime" => Value::Long(v.execution_max_idle_time_ms as i64),
            "SendMsgRetries" => Value::Long(v.send_msg_retries as i64),
            _ => unreachable!("canonical returns table names"),
        })
    }

    /// Runtime `configset` path; load-time-only options are refused.
    pub fn set(&self, name: &str, value: &str) -> Result<(), Error> {
        self.set_internal(name, value, true)
    }

    fn set_internal(&self, name: &str, value: &str, at_runtime: bool) -> Result<(), Error> {
        let name = canonical(name)?;
        let runtime_settable = !matches!(name, "PluginHomeDir" | "ExecutionThreads");
        if at_runtime && !runtime_settable {
            return Err(Error::NotRuntimeSettable(name.to_string()));
        }

        let parse_long = |v: &str| -> Result<i64, Error> {
            v.parse().map_err(|_| Error::BadValue {
                name: name.to_string(),
                value: v.to_string(),
            })
        };
        let parse_size = |v: &str| -> Result<usize, Error> {
            let n = parse_long(v)?;
            usize::try_from(n).map_err(|_| Error::BadValue {
                name: name.to_string(),
                value: v.to_string(),
            })
        };

        let mut values = self.values.write();
        match name {
            "PluginHomeDir" => values.plugin_home_dir = value.to_string(),
            "MaxExecutions" => values.max_executions = parse_size(value)?,
            "MaxExecutionsPerRegistration" => {
                values.max_executions_per_registration = parse_size(value)?
            }
            "ProfileExecutions" => values.profile_executions = parse_long(value)? != 0,
            "ExecutionThreads" => {
                let n = parse_size(value)?;
                if n == 0 {
                    return Err(Error::BadValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                }
                values.execution_threads = n;
            }
            "ExecutionMaxIdleTime" => {
                values.execution_max_idle_time_ms = parse_long(value)?.max(0) as u64
            }
            "SendMsgRetries" => values.send_msg_retries = parse_size(value)?,
            _ => unreachable!("canonical returns table names"),
        }
        Ok(())
    }

    pub fn plugin_home_dir(&self) -> String {
        self.values.read().plugin_home_dir.clone()
    }

    pub fn max_executions(&self) -> usize {
        self.values.read().max_executions
    }

    pub fn max_executions_per_registration(&self) -> usize {
        self.values.read().max_executions_per_registration
    }

    pub fn profile_executions(&self) -> bool {
        self.values.read().profile_executions
    }

    pub fn execution_threads(&self) -> usize {
        self.values.read().execution_threads
    }

    pub fn execution_max_idle_time(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.values.read().execution_max_idle_time_ms)
    }

    pub fn send_msg_retries(&self) -> usize {
        self.values.read().send_msg_retries
    }
}

fn canonical(name: &str) -> Result<&'static str, Error> {
    // "PythonHomeDir" survives as a compatibility spelling of the
    // plugin home option.
    if name.eq_ignore_ascii_case("PythonHomeDir") {
        return Ok("PluginHomeDir");
    }
    NAMES
        .iter()
        .find(|n| n.eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| Error::Unknown(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_case_insensitive_lookup() {
        let config = Config::new();
        assert_eq!(config.get("maxexecutions").unwrap(), Value::Long(1000));
        assert_eq!(
            config.get("EXECUTIONMAXIDLETIME").unwrap(),
            Value::Long(5000)
        );
        assert!(matches!(config.get("NoSuchKey"), Err(Error::Unknown(_))));
    }

    #[test]
    fn runtime_set_respects_mutability() {
        let config = Config::new();
        config.set("MaxExecutions", "7").unwrap();
        assert_eq!(config.max_executions(), 7);

        assert!(matches!(
            config.set("ExecutionThreads", "9"),
            Err(Error::NotRuntimeSettable(_))
        ));
        assert!(matches!(
            config.set("MaxExecutions", "not-a-number"),
            Err(Error::BadValue { .. })
        ));
    }

    #[test]
    fn load_args_may_set_everything() {
        let config = Config::new();
        config
            .apply_load_args(&[
                "ExecutionThreads".to_string(),
                "5".to_string(),
                "ProfileExecutions".to_string(),
                "1".to_string(),
            ])
            .unwrap();
        assert_eq!(config.execution_threads(), 5);
        assert!(config.profile_executions());

        assert!(matches!(
            config.apply_load_args(&["MaxExecutions".to_string()]),
            Err(Error::MissingValue(_))
        ));
    }

    #[test]
    fn python_home_dir_is_an_alias() {
        let config = Config::new();
        config
            .apply_load_args(&["PythonHomeDir".to_string(), "/opt/plugins".to_string()])
            .unwrap();
        assert_eq!(config.plugin_home_dir(), "/opt/plugins");
        assert_eq!(
            config.get("PythonHomeDir").unwrap(),
            Value::Str("/opt/plugins".to_string())
        );
    }
}
