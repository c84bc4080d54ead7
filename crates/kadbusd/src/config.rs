use anyhow::{Context, Result};
use kadbus_dht::{DhtConfig, NodeRole};
use kadbus_protocol::{Contact, NodeId};
use kadbus_runtime::{AgentSpec, PipelineSettings, ScheduleSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub dht: DhtConfig,
    pub bootstrap: BootstrapConfig,
    pub pipelines: PipelineSettings,
    pub scheduling: ScheduleSettings,
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local nodes hosted by this process
    pub instances: usize,
    /// Hex id of the first instance; random when unset
    pub nodeid: Option<String>,
    pub role: NodeRole,
    pub bootstrap_grace_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instances: 3,
            nodeid: None,
            role: NodeRole::Seed,
            bootstrap_grace_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Seeds as `<hex-id>@<address>`
    pub urls: Vec<String>,
    /// One seed url per line, relative to the config file
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            dht: DhtConfig::default(),
            bootstrap: BootstrapConfig::default(),
            pipelines: PipelineSettings::default(),
            scheduling: ScheduleSettings {
                agents: default_agents(),
                ..Default::default()
            },
            logging: LoggingConfig::default(),
            config_file_path: PathBuf::new(),
        }
    }
}

/// DHT maintenance, message cache sweeps and republish draining
fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec::new("dht", "refresh_buckets", 900),
        AgentSpec::new("dht", "replicate", 3600),
        AgentSpec::new("dht", "republish", 3600),
        AgentSpec::new("dht", "ensure_integrity", 600),
        AgentSpec::new("dht", "purge_expired", 300),
        AgentSpec::new("cache", "purge_expired", 60),
        AgentSpec::new("republish-queue", "drain", 30).with_param("max_events", "100"),
    ]
}

impl Config {
    /// Load configuration from `config_path`
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.config_file_path = config_path.to_path_buf();
        config.validate()?;

        Ok(config)
    }

    /// Write a default configuration to `config_path`
    pub fn create_default(config_path: &Path) -> Result<Self> {
        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let config = Config {
            config_file_path: config_path.to_path_buf(),
            ..Default::default()
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.instances == 0 {
            anyhow::bail!("node.instances must be at least 1");
        }
        if let Some(id) = &self.node.nodeid {
            NodeId::from_hex(id).with_context(|| format!("Invalid node.nodeid {}", id))?;
        }
        self.dht_config().validate().context("Invalid dht section")?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// DHT settings with the node section applied
    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            role: self.node.role,
            bootstrap_grace_secs: self.node.bootstrap_grace_secs,
            ..self.dht.clone()
        }
    }

    /// Id of local instance `index`
    pub fn node_id(&self, index: usize) -> Result<NodeId> {
        match (&self.node.nodeid, index) {
            (Some(id), 0) => Ok(NodeId::from_hex(id)?),
            _ => Ok(NodeId::random()),
        }
    }

    /// Seeds from `bootstrap.urls` followed by those in `bootstrap.file`
    pub fn bootstrap_contacts(&self) -> Result<Vec<Contact>> {
        let mut urls = self.bootstrap.urls.clone();

        if let Some(file) = &self.bootstrap.file {
            let path = match self.config_file_path.parent() {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read bootstrap file {}", path.display()))?;
            urls.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }

        urls.iter().map(|url| parse_bootstrap_url(url)).collect()
    }
}

/// Parse `<hex-id>@<address>`
pub fn parse_bootstrap_url(url: &str) -> Result<Contact> {
    let (id, address) = url
        .split_once('@')
        .with_context(|| format!("Bootstrap url {} is not <id>@<address>", url))?;
    if address.is_empty() {
        anyhow::bail!("Bootstrap url {} has no address", url);
    }
    let node_id = NodeId::from_hex(id).with_context(|| format!("Invalid node id in {}", url))?;
    Ok(Contact::new(node_id, address))
}
