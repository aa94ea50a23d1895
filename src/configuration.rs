use serde_aux::field_attributes::{
    deserialize_number_from_string, deserialize_option_number_from_string,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(serde::Deserialize, Clone, Debug)]
pub struct Settings {
    pub probe: ProbeSettings,
    #[serde(default)]
    pub forks: Vec<ForkSettings>,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct ProbeSettings {
    pub url: String,
    pub expected_body: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub connect_timeout_milliseconds: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub socket_timeout_milliseconds: u64,
}

impl ProbeSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_milliseconds)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_milliseconds)
    }
}

/// A background process to launch before probing.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct ForkSettings {
    pub name: String,
    pub command: CommandSettings,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment: Vec<EnvironmentVariable>,
    /// File receiving the process's standard output. Logged when unset.
    #[serde(default)]
    pub standard_output: Option<PathBuf>,
    /// File receiving the process's error output. When unset, standard error
    /// shares the standard output sink.
    #[serde(default)]
    pub error_output: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub wait_for_port: Option<u16>,
    #[serde(default)]
    pub wait_for_output: Option<String>,
    #[serde(default)]
    pub wait_for_error: Option<String>,
    #[serde(
        default = "default_timeout_seconds",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub force_kill: bool,
    #[serde(default = "default_kill_descendants")]
    pub kill_descendants: bool,
}

impl ForkSettings {
    pub fn exec(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandSettings::Exec {
                executable: executable.into(),
                args: Vec::new(),
            },
            working_dir: None,
            environment: Vec::new(),
            standard_output: None,
            error_output: None,
            wait_for_port: None,
            wait_for_output: None,
            wait_for_error: None,
            timeout_seconds: default_timeout_seconds(),
            force_kill: false,
            kill_descendants: default_kill_descendants(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandSettings {
    Exec {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Java {
        main_class: String,
        #[serde(default)]
        classpath: Vec<PathBuf>,
        #[serde(default)]
        jvm_args: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        java_home: Option<PathBuf>,
    },
}

// Kept as a list rather than a map: `config` normalises map keys.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_kill_descendants() -> bool {
    true
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!(
            "Failed to determine the current directory: {}",
            e
        ))
    })?;
    let configuration_directory = base_path.join("configuration");

    // Detect the running environment.
    // Default to `local` if unspecified.
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    load_configuration(&configuration_directory, environment)
}

pub fn load_configuration(
    configuration_directory: &Path,
    environment: Environment,
) -> Result<Settings, config::ConfigError> {
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(configuration_directory.join(environment_filename))
                .required(false),
        )
        // Add in settings from environment variables (with a prefix of APP and '__' as separator)
        // E.g. `APP_PROBE__URL=http://127.0.0.1:8000/` would set `Settings.probe.url`
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}

/// The possible runtime environment for our application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. \
                Use either `local` or `production`.",
                other
            )),
        }
    }
}
