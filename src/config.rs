//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::orchestrator::{OrchestratorSettings, RetirePolicy, RetryPolicy};
use crate::task::{CredentialsRef, DEFAULT_SERVICE_PORT, ServiceRef};

/// Relay configuration derived from defaults, configuration files and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SIMRELAY",
    discovery(
        app_name = "simrelay",
        env_var = "SIMRELAY_CONFIG_PATH",
        config_file_name = "simrelay.toml",
        dotfile_name = ".simrelay.toml",
        project_file_name = "simrelay.toml"
    )
)]
pub struct RelayConfig {
    /// Directory holding one JSON record per task.
    #[ortho_config(default = ".simrelay/state".to_owned())]
    pub state_dir: String,
    /// Requester identity used to scope service teardown.
    #[ortho_config(default = "simrelay".to_owned())]
    pub owner: String,
    /// Name of the managed service container.
    #[ortho_config(default = "simrelay-cerise".to_owned())]
    pub service_name: String,
    /// Container image providing the job service.
    #[ortho_config(default = "mdstudio/cerise-mdstudio-das5:develop".to_owned())]
    pub service_image: String,
    /// Host on which the service port is published.
    #[ortho_config(default = "localhost".to_owned())]
    pub service_host: String,
    /// Published port of the service.
    #[ortho_config(default = 29593)]
    pub service_port: u16,
    /// Account name forwarded to the service, if any.
    pub service_username: Option<String>,
    /// Environment variable holding the service password.
    #[ortho_config(default = "SIMRELAY_SERVICE_PASSWORD".to_owned())]
    pub service_password_env: String,
    /// Container runtime binary.
    #[ortho_config(default = "docker".to_owned())]
    pub docker_bin: String,
    /// Directory containing the workflow documents.
    #[ortho_config(default = "workflows".to_owned())]
    pub workflows_dir: String,
    /// Seconds between completion polls.
    #[ortho_config(default = 30)]
    pub poll_interval_secs: u64,
    /// Seconds between polls while a job is still waiting to start.
    #[ortho_config(default = 2)]
    pub waiting_poll_interval_secs: u64,
    /// Provisioning attempts before giving up.
    #[ortho_config(default = 10)]
    pub provision_attempts: u32,
    /// Optional bound on the synchronous wait; unbounded when unset.
    pub wait_timeout_secs: Option<u64>,
    /// Teardown policy: `owner` or `service-jobs`.
    #[ortho_config(default = "owner".to_owned())]
    pub retire_policy: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl RelayConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to simrelay.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("simrelay")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.state_dir,
                FieldMetadata::new("state directory", "SIMRELAY_STATE_DIR", "state_dir"),
            ),
            (
                &self.owner,
                FieldMetadata::new("owner identity", "SIMRELAY_OWNER", "owner"),
            ),
            (
                &self.service_name,
                FieldMetadata::new("service name", "SIMRELAY_SERVICE_NAME", "service_name"),
            ),
            (
                &self.service_image,
                FieldMetadata::new("service image", "SIMRELAY_SERVICE_IMAGE", "service_image"),
            ),
            (
                &self.service_host,
                FieldMetadata::new("service host", "SIMRELAY_SERVICE_HOST", "service_host"),
            ),
            (
                &self.docker_bin,
                FieldMetadata::new("container runtime", "SIMRELAY_DOCKER_BIN", "docker_bin"),
            ),
            (
                &self.workflows_dir,
                FieldMetadata::new(
                    "workflow directory",
                    "SIMRELAY_WORKFLOWS_DIR",
                    "workflows_dir",
                ),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }
        if self.service_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "service_port must be greater than zero",
            )));
        }
        if self.poll_interval_secs == 0 || self.waiting_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll intervals must be at least one second",
            )));
        }
        if self.provision_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "provision_attempts must be greater than zero",
            )));
        }
        self.parsed_retire_policy()?;
        Ok(())
    }

    /// Parses the configured teardown policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown policy names.
    pub fn parsed_retire_policy(&self) -> Result<RetirePolicy, ConfigError> {
        match self.retire_policy.trim() {
            "owner" => Ok(RetirePolicy::OwnerActiveTasks),
            "service-jobs" => Ok(RetirePolicy::ServiceJobs),
            other => Err(ConfigError::Invalid(format!(
                "unknown retire_policy '{other}': expected 'owner' or 'service-jobs'"
            ))),
        }
    }

    /// Builds the default service reference from configuration.
    #[must_use]
    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef {
            name: self.service_name.trim().to_owned(),
            host: self.service_host.trim().to_owned(),
            port: if self.service_port == 0 {
                DEFAULT_SERVICE_PORT
            } else {
                self.service_port
            },
            image: self.service_image.trim().to_owned(),
            credentials: self
                .service_username
                .as_ref()
                .filter(|name| !name.trim().is_empty())
                .map(|username| CredentialsRef {
                    username: username.trim().to_owned(),
                    password_env: self.service_password_env.trim().to_owned(),
                }),
        }
    }

    /// Builds orchestrator timing and policy settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings, ConfigError> {
        self.validate()?;
        Ok(OrchestratorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            waiting_poll_interval: Duration::from_secs(self.waiting_poll_interval_secs),
            retry: RetryPolicy {
                max_attempts: self.provision_attempts,
                ..RetryPolicy::default()
            },
            wait_timeout: self.wait_timeout_secs.map(Duration::from_secs),
            retire_policy: self.parsed_retire_policy()?,
            ..OrchestratorSettings::default()
        })
    }

    /// State directory as a path.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.state_dir.trim())
    }

    /// Workflow directory as a path.
    #[must_use]
    pub fn workflows_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.workflows_dir.trim())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> RelayConfig {
        RelayConfig {
            state_dir: String::from("/tmp/state"),
            owner: String::from("alice"),
            service_name: String::from("svc"),
            service_image: String::from("image:latest"),
            service_host: String::from("localhost"),
            service_port: 29593,
            service_username: Some(String::from("alice")),
            service_password_env: String::from("PW_ENV"),
            docker_bin: String::from("docker"),
            workflows_dir: String::from("workflows"),
            poll_interval_secs: 30,
            waiting_poll_interval_secs: 2,
            provision_attempts: 10,
            wait_timeout_secs: None,
            retire_policy: String::from("owner"),
        }
    }

    #[rstest]
    fn valid_config_passes(config: RelayConfig) {
        assert!(config.validate().is_ok());
    }

    #[rstest]
    fn blank_service_image_names_env_var(mut config: RelayConfig) {
        config.service_image = String::from("  ");
        let err = config.validate().expect_err("blank image should fail");
        assert!(
            err.to_string().contains("SIMRELAY_SERVICE_IMAGE"),
            "unexpected message: {err}"
        );
    }

    #[rstest]
    #[case("owner", RetirePolicy::OwnerActiveTasks)]
    #[case("service-jobs", RetirePolicy::ServiceJobs)]
    fn parses_retire_policy(mut config: RelayConfig, #[case] raw: &str, #[case] expected: RetirePolicy) {
        config.retire_policy = raw.to_owned();
        assert_eq!(config.parsed_retire_policy(), Ok(expected));
    }

    #[rstest]
    fn rejects_unknown_retire_policy(mut config: RelayConfig) {
        config.retire_policy = String::from("never");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(message)) if message.contains("never")
        ));
    }

    #[rstest]
    fn service_ref_carries_credentials_reference(config: RelayConfig) {
        let service = config.service_ref();
        assert_eq!(service.name, "svc");
        assert_eq!(service.base_url(), "http://localhost:29593");
        let credentials = service.credentials.expect("credentials configured");
        assert_eq!(credentials.password_env, "PW_ENV");
    }

    #[rstest]
    fn settings_follow_configuration(mut config: RelayConfig) {
        config.wait_timeout_secs = Some(600);
        config.provision_attempts = 3;
        let settings = config.orchestrator_settings().expect("settings");
        assert_eq!(settings.poll_interval, Duration::from_secs(30));
        assert_eq!(settings.wait_timeout, Some(Duration::from_secs(600)));
        assert_eq!(settings.retry.max_attempts, 3);
    }
}
