//! Configuration: TOML with include-file merging, validated into a global
//! snapshot the rest of the worker reads through `get_config()`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{error, info};
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

mod byte_size;
mod duration;
mod general;
pub mod port;

#[cfg(test)]
mod tests;

pub use byte_size::ByteSize;
pub use duration::Duration;
pub use general::General;
pub use port::{parse_port_directive, PortCfg, PortTransport, TcpKeepAlive};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Static credential table standing in for external auth helpers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AuthSettings {
    /// Basic users; an empty table disables enforcement.
    pub basic_users: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Include {
    pub files: Vec<String>,
}

impl Include {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    // Keep simple fields before nested tables so the TOML serializer never
    // emits a value after a table header.
    #[serde(
        default = "Config::default_path",
        skip_serializing_if = "String::is_empty"
    )]
    pub path: String,

    /// `http_port` directive values.
    #[serde(default)]
    pub http_port: Vec<String>,

    /// `https_port` directive values.
    #[serde(default)]
    pub https_port: Vec<String>,

    /// `ftp_port` directive values.
    #[serde(default)]
    pub ftp_port: Vec<String>,

    // General and global settings.
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub auth: AuthSettings,

    // Include files.
    #[serde(default, skip_serializing_if = "Include::is_empty")]
    pub include: Include,
}

impl Config {
    pub fn default_path() -> String {
        String::from("kestrel.toml")
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: Self::default_path(),
            http_port: Vec::new(),
            https_port: Vec::new(),
            ftp_port: Vec::new(),
            general: General::default(),
            auth: AuthSettings::default(),
            include: Include::default(),
        }
    }
}

impl Config {
    /// Print current configuration.
    pub fn show(&self) {
        info!("Workers: {}", self.general.workers);
        info!("Max connections: {}", self.general.max_connections);
        info!("Event backend: {}", self.general.event_backend);
        info!("Cache memory: {}", self.general.cache_mem);
        info!(
            "Max in-memory object: {}",
            self.general.max_object_size_in_memory
        );
        info!("Connect timeout: {}ms", self.general.connect_timeout);
        info!("Read timeout: {}ms", self.general.read_timeout);
        info!("Visible hostname: {}", self.general.visible_hostname);
        for p in &self.http_port {
            info!("http_port {p}");
        }
        for p in &self.https_port {
            info!("https_port {p}");
        }
        for p in &self.ftp_port {
            info!("ftp_port {p}");
        }
        if let Some(ref parent) = self.general.parent_proxy {
            info!("Parent proxy: {parent}");
        }
        if self.auth.basic_users.is_empty() {
            info!("Proxy authentication: disabled");
        } else {
            info!(
                "Proxy authentication: {} basic users",
                self.auth.basic_users.len()
            );
        }
    }

    /// Parse every configured port, returning the structured list. Called at
    /// startup (fatal on error) and from validation.
    pub fn listening_ports(&self) -> Result<Vec<PortCfg>, Error> {
        let mut out = Vec::new();
        for p in &self.http_port {
            out.push(parse_port_directive(PortTransport::Http, p)?);
        }
        for p in &self.https_port {
            out.push(parse_port_directive(PortTransport::Https, p)?);
        }
        for p in &self.ftp_port {
            out.push(parse_port_directive(PortTransport::Ftp, p)?);
        }
        Ok(out)
    }

    /// Validate the configuration.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.general.max_connections < 64 {
            return Err(Error::BadConfig(
                "max_connections must be at least 64".to_string(),
            ));
        }
        if self.general.backend_kind().is_none() {
            return Err(Error::BadConfig(format!(
                "unknown event_backend {:?} (expected \"poll\" or \"epoll\")",
                self.general.event_backend
            )));
        }
        if self.http_port.is_empty() && self.https_port.is_empty() && self.ftp_port.is_empty() {
            return Err(Error::BadConfig(
                "no http_port, https_port or ftp_port configured".to_string(),
            ));
        }

        // surface port/TLS token errors at config time, not at listen time
        self.listening_ports()?;

        if let Some(ref parent) = self.general.parent_proxy {
            if parent.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(Error::BadConfig(format!(
                    "parent_proxy must be host:port, got {parent:?}"
                )));
            }
        }

        Ok(())
    }
}

/// Get a read-only instance of the configuration from anywhere in the app.
/// ArcSwap makes this cheap and quick.
pub fn get_config() -> Arc<Config> {
    CONFIG.load_full()
}

fn load_file(path: &str) -> Result<String, Error> {
    std::fs::read_to_string(path)
        .map_err(|err| Error::BadConfig(format!("Could not open '{path}': {err}")))
}

/// Parse the TOML configuration at `path`, merging any include files, and
/// install it globally.
pub fn parse(path: &str) -> Result<(), Error> {
    let main_contents = load_file(path)?;

    // first pass reads only include.files
    let include_probe: Config = toml::from_str(&main_contents)
        .map_err(|err| Error::BadConfig(format!("Could not parse config file {path}: {err}")))?;

    let mut merged: toml::Value = main_contents
        .parse()
        .map_err(|err| Error::BadConfig(format!("Could not parse config file {path}: {err:?}")))?;

    for file in &include_probe.include.files {
        info!("Merge config with include file: {file}");
        let contents = load_file(file)?;
        let value: toml::Value = contents.parse().map_err(|err| {
            Error::BadConfig(format!("Could not parse include file {file}: {err:?}"))
        })?;
        merged = serde_toml_merge::merge(merged, value).map_err(|err| {
            Error::BadConfig(format!("Could not merge config file {file}: {err:?}"))
        })?;
    }

    let table = merged
        .as_table()
        .ok_or_else(|| Error::BadConfig("config root must be a table".to_string()))?;
    let mut config: Config = toml::from_str(&table.to_string())
        .map_err(|err| Error::BadConfig(format!("Could not merge config: {err:?}")))?;

    config.validate()?;
    config.path = path.to_string();

    CONFIG.store(Arc::new(config));
    Ok(())
}

/// Install a config directly; used by tests and embedded setups.
pub fn install(config: Config) {
    CONFIG.store(Arc::new(config));
}

pub fn reload_config() -> Result<bool, Error> {
    let old_config = get_config();

    if let Err(err) = parse(&old_config.path) {
        error!("Config reload error: {err:?}");
        return Err(err);
    }

    let new_config = get_config();
    if *old_config != *new_config {
        info!("Config changed, reloading");
        Ok(true)
    } else {
        Ok(false)
    }
}
