use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::lifecycle::Plan;
use crate::provisioner::{AdminCredential, KeyMaterial, ProvisionerName};
use crate::runner::StepCli;
use crate::wait::MAX_POLL_INTERVAL;

const ENV_PREFIX: &str = "TEMPJWK";

/// Settings for one run.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub admin_provisioner: String,
    pub admin_subject: String,
    pub provisioner_name: String,
    pub public_key: PathBuf,
    pub private_key: PathBuf,
    /// Seconds to wait before revoking
    pub timeout: u64,
    pub poll_interval_ms: u64,
    pub step_bin: PathBuf,
    pub gpg_bin: PathBuf,
    /// Base for relative key paths; the executable's directory when unset
    #[serde(default)]
    pub key_dir: Option<PathBuf>,
    /// Staging directory for the plaintext key; system temp when unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings: defaults, then `--config` file, then `TEMPJWK_*`
    /// environment variables, then command-line flags.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    pub fn load_with_env(cli: &Cli, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = defaults()?;
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }
        let builder = overrides(builder.add_source(env), cli)?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ProvisionerName::new(self.provisioner_name.as_str())?;
        if self.admin_provisioner.trim().is_empty() {
            return Err(ConfigError::invalid("admin_provisioner", "must not be empty"));
        }
        if self.admin_subject.trim().is_empty() {
            return Err(ConfigError::invalid("admin_subject", "must not be empty"));
        }
        let max = MAX_POLL_INTERVAL.as_millis() as u64;
        if self.poll_interval_ms == 0 || self.poll_interval_ms > max {
            return Err(ConfigError::invalid(
                "poll_interval_ms",
                format!("must be between 1 and {}", max),
            ));
        }
        Ok(())
    }

    pub fn admin(&self) -> AdminCredential {
        AdminCredential::new(self.admin_provisioner.as_str(), self.admin_subject.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Directory relative key paths are taken from.
    pub fn base_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.key_dir {
            return Ok(dir.clone());
        }
        let exe = std::env::current_exe().map_err(ConfigError::BaseDir)?;
        Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
    }

    pub fn key_material(&self) -> Result<KeyMaterial, ConfigError> {
        Ok(KeyMaterial::resolve(
            &self.base_dir()?,
            &self.public_key,
            &self.private_key,
        ))
    }

    /// Everything the lifecycle needs, resolved.
    pub fn plan(&self) -> Result<Plan, ConfigError> {
        Ok(Plan {
            name: ProvisionerName::new(self.provisioner_name.as_str())?,
            admin: self.admin(),
            keys: self.key_material()?,
            timeout: self.timeout(),
            poll_interval: self.poll_interval(),
            scratch_dir: self.scratch_dir.clone(),
        })
    }

    pub fn runner(&self) -> StepCli {
        StepCli::new(self.step_bin.as_path(), self.gpg_bin.as_path())
    }
}

type Builder = ConfigBuilder<config::builder::DefaultState>;

fn defaults() -> Result<Builder, ConfigError> {
    Ok(Config::builder()
        .set_default("admin_provisioner", "KumiDC")?
        .set_default("admin_subject", "admin")?
        .set_default("provisioner_name", "tempjwk")?
        .set_default("public_key", "key.pub")?
        .set_default("private_key", "key.priv.gpg")?
        .set_default("timeout", 300u64)?
        .set_default("poll_interval_ms", MAX_POLL_INTERVAL.as_millis() as u64)?
        .set_default("step_bin", "step-cli")?
        .set_default("gpg_bin", "gpg")?)
}

fn overrides(builder: Builder, cli: &Cli) -> Result<Builder, ConfigError> {
    let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());
    Ok(builder
        .set_override_option("admin_provisioner", cli.admin_provisioner.clone())?
        .set_override_option("admin_subject", cli.admin_subject.clone())?
        .set_override_option("provisioner_name", cli.provisioner_name.clone())?
        .set_override_option("public_key", path(&cli.public_key))?
        .set_override_option("private_key", path(&cli.private_key))?
        .set_override_option("timeout", cli.timeout)?
        .set_override_option("poll_interval_ms", cli.poll_interval_ms)?
        .set_override_option("key_dir", path(&cli.key_dir))?
        .set_override_option("scratch_dir", path(&cli.scratch_dir))?
        .set_override_option("step_bin", path(&cli.step_bin))?
        .set_override_option("gpg_bin", path(&cli.gpg_bin))?)
}
