use crate::process::RegistrySettings;
use crate::proxy::CaddySettings;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and data directory settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Settings applied to every supervised process
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Bind address for the API and for port probing
    #[serde(default = "default_host")]
    pub host: String,

    /// API port (0 picks an ephemeral port)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Domain suffix for routed servers
    #[serde(default = "default_tld")]
    pub tld: String,

    /// Root for server configs, logs and the pid file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Liveness marker (defaults to `<data_dir>/daemon.pid`)
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            tld: default_tld(),
            data_dir: default_data_dir(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// Environment variable that carries the assigned port
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// Shell used to run server commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Wait between the graceful signal and the forceful kill
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// Lines returned by a log read when none are requested
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            port_env: default_port_env(),
            shell: default_shell(),
            stop_grace_period_secs: default_stop_grace_period(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Launch Caddy and route domains through it
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_caddy_binary")]
    pub binary: String,

    /// Port Caddy serves routed domains on
    #[serde(default = "default_proxy_listen_port")]
    pub listen_port: u16,

    /// Caddy admin API address
    #[serde(default = "default_proxy_admin_addr")]
    pub admin_addr: String,

    /// Serve routed domains over HTTPS with Caddy's internal issuer
    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default = "default_proxy_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_caddy_binary(),
            listen_port: default_proxy_listen_port(),
            admin_addr: default_proxy_admin_addr(),
            tls: true,
            startup_timeout_secs: default_proxy_startup_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    2001
}

fn default_tld() -> String {
    "localhost".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs_next::home_dir()
        .map(|home| home.join(".devgate"))
        .unwrap_or_else(|| PathBuf::from(".devgate"))
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_log_tail_lines() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_caddy_binary() -> String {
    "caddy".to_string()
}

fn default_proxy_listen_port() -> u16 {
    2000
}

fn default_proxy_admin_addr() -> String {
    "127.0.0.1:2019".to_string()
}

fn default_proxy_startup_timeout() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else from `<default data_dir>/config.toml` if it
    /// exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let fallback = default_data_dir().join("config.toml");
        if fallback.exists() {
            return Self::load(fallback);
        }
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.tld.trim().is_empty() {
            errors.push("server.tld must not be empty".to_string());
        }
        if self.server.host.parse::<IpAddr>().is_err() {
            errors.push(format!("server.host '{}' is not an IP address", self.server.host));
        }
        if self.supervisor.shell.trim().is_empty() {
            errors.push("supervisor.shell must not be empty".to_string());
        }
        if self.supervisor.port_env.trim().is_empty() {
            errors.push("supervisor.port_env must not be empty".to_string());
        }
        if self.proxy.enabled && self.server.api_port != 0 && self.server.api_port == self.proxy.listen_port {
            errors.push(format!(
                "server.api_port and proxy.listen_port are both {}",
                self.server.api_port
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.server.data_dir.join("servers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.server.data_dir.join("logs")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.server
            .pid_file
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("daemon.pid"))
    }

    /// API bind address
    pub fn api_addr(&self) -> anyhow::Result<SocketAddr> {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid host '{}': {}", self.server.host, e))?;
        Ok(SocketAddr::new(host, self.server.api_port))
    }

    pub fn registry_settings(&self) -> anyhow::Result<RegistrySettings> {
        let mut settings = RegistrySettings::new(self.logs_dir())
            .with_grace_period(Duration::from_secs(self.supervisor.stop_grace_period_secs));
        settings.host = self.api_addr()?.ip();
        settings.port_env = self.supervisor.port_env.clone();
        settings.shell = self.supervisor.shell.clone();
        Ok(settings)
    }

    pub fn caddy_settings(&self) -> CaddySettings {
        CaddySettings {
            binary: self.proxy.binary.clone(),
            listen_port: self.proxy.listen_port,
            admin_addr: self.proxy.admin_addr.clone(),
            tls: self.proxy.tls,
            fallback_port: Some(self.server.api_port).filter(|p| *p != 0),
            config_path: self.server.data_dir.join("caddy.json"),
            startup_timeout: Duration::from_secs(self.proxy.startup_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
api_port = 9001
tld = "test"
data_dir = "/tmp/devgate"

[supervisor]
port_env = "APP_PORT"
stop_grace_period_secs = 3

[proxy]
listen_port = 8080
tls = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.api_port, 9001);
        assert_eq!(config.server.tld, "test");
        assert_eq!(config.supervisor.port_env, "APP_PORT");
        assert_eq!(config.supervisor.shell, "sh");
        assert!(config.proxy.enabled);
        assert!(!config.proxy.tls);
        assert_eq!(config.servers_dir(), PathBuf::from("/tmp/devgate/servers"));
        assert_eq!(config.logs_dir(), PathBuf::from("/tmp/devgate/logs"));
        assert_eq!(config.pid_file(), PathBuf::from("/tmp/devgate/daemon.pid"));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.api_port, 2001);
        assert_eq!(config.server.tld, "localhost");
        assert_eq!(config.supervisor.stop_grace_period_secs, 10);
        assert_eq!(config.supervisor.log_tail_lines, 100);
        assert_eq!(config.proxy.listen_port, 2000);
        assert_eq!(config.proxy.admin_addr, "127.0.0.1:2019");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_pid_file() {
        let config: Config = toml::from_str(
            r#"
[server]
data_dir = "/tmp/devgate"
pid_file = "/run/devgate.pid"
"#,
        )
        .unwrap();
        assert_eq!(config.pid_file(), PathBuf::from("/run/devgate.pid"));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let config: Config = toml::from_str(
            r#"
[server]
api_port = 2000
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("api_port"));

        // no clash when the proxy is off
        let config: Config = toml::from_str(
            r#"
[server]
api_port = 2000

[proxy]
enabled = false
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let config: Config = toml::from_str(
            r#"
[server]
tld = ""
host = "not-an-ip"

[supervisor]
shell = ""
port_env = " "
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("tld"));
        assert!(err.contains("host"));
        assert!(err.contains("shell"));
        assert!(err.contains("port_env"));
    }

    #[test]
    fn test_derived_settings() {
        let config: Config = toml::from_str(
            r#"
[server]
api_port = 0
data_dir = "/tmp/devgate"

[supervisor]
shell = "bash"
stop_grace_period_secs = 2
"#,
        )
        .unwrap();

        let registry = config.registry_settings().unwrap();
        assert_eq!(registry.shell, "bash");
        assert_eq!(registry.stop_grace_period, Duration::from_secs(2));
        assert_eq!(registry.logs_dir, PathBuf::from("/tmp/devgate/logs"));

        let caddy = config.caddy_settings();
        assert_eq!(caddy.fallback_port, None);
        assert_eq!(caddy.config_path, PathBuf::from("/tmp/devgate/caddy.json"));
    }
}
