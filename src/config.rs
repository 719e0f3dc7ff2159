use std::{env, net::SocketAddr, path::Path};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use gitlab_artifacts::GitLabConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub structured_logging: bool,
    pub upload_dir: String,
    pub artifact_dir: String,
    pub scratch_dir: String,
    /// Fleet of installable units, by address.
    pub units: Vec<String>,
    /// Installer invocation prefix; `-path/-ip/-version` flags are appended
    /// per run.
    pub installer_command: Vec<String>,
    pub gitlab: GitLabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let storage_root = env::current_dir()
            .expect("cannot determine current directory")
            .join("server_storage");
        ServerConfig {
            listen_addr: "0.0.0.0:3000".to_string(),
            structured_logging: false,
            upload_dir: storage_root.join("upload").to_string_lossy().to_string(),
            artifact_dir: storage_root
                .join("uploadFromRepo")
                .to_string_lossy()
                .to_string(),
            scratch_dir: storage_root
                .join("gitArtifact")
                .to_string_lossy()
                .to_string(),
            units: vec![
                "192.168.100.64".to_string(),
                "192.168.100.65".to_string(),
                "172.16.20.97".to_string(),
                "192.168.100.67".to_string(),
                "192.168.100.1".to_string(),
            ],
            installer_command: vec![
                "python3".to_string(),
                "installer/install_sw.py".to_string(),
            ],
            gitlab: GitLabConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a YAML config, layering it over the defaults and letting
    /// `SWINSTALL_`-prefixed environment variables (nested keys separated by
    /// `__`, e.g. `SWINSTALL_GITLAB__ACCESS_TOKEN`) override both.
    pub fn from_path(path: &Path) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .merge(Env::prefixed("SWINSTALL_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.units.is_empty() {
            return Err(anyhow::anyhow!("at least one unit must be configured"));
        }
        if self.installer_command.is_empty() {
            return Err(anyhow::anyhow!("installer_command must not be empty"));
        }
        Ok(())
    }
}
