use std::{net::SocketAddr, sync::Arc, time::Duration};

use easy_error::{Error, ResultExt, bail};
use serde::{Deserialize, Serialize};

use crate::context::TargetAddress;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<Arc<Server>>,
    #[serde(default)]
    pub index: usize,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default)]
    pub share_over_lan: bool,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub verbose_logging: bool,
}

fn default_local_port() -> u16 {
    1080
}

impl Default for Config {
    fn default() -> Self {
        Config {
            servers: vec![],
            index: 0,
            local_port: default_local_port(),
            share_over_lan: false,
            proxy: Default::default(),
            verbose_logging: false,
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, Error> {
        let s = tokio::fs::read(path).await.context("read file")?;
        let s = String::from_utf8(s).context("parse utf8")?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> Result<Self, Error> {
        serde_yaml_ng::from_str(s).context("parse yaml")
    }

    pub fn verify(&self) -> Result<(), Error> {
        if !self.servers.is_empty() && self.index >= self.servers.len() {
            bail!(
                "server index {} out of range, {} servers configured",
                self.index,
                self.servers.len()
            );
        }
        if self.proxy.use_proxy && self.proxy.proxy_server.is_empty() {
            bail!("forward proxy enabled without proxyServer");
        }
        Ok(())
    }

    /// The server selected by `index`, used when no strategy is installed.
    pub fn current_server(&self) -> Option<Arc<Server>> {
        self.servers.get(self.index).cloned()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        let ip = if self.share_over_lan {
            [0, 0, 0, 0]
        } else {
            [127, 0, 0, 1]
        };
        SocketAddr::from((ip, self.local_port))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub server: String,
    #[serde(rename = "server_port", alias = "serverPort")]
    pub server_port: u16,
    pub password: String,
    pub method: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
}

fn default_server_timeout() -> u64 {
    5
}

impl Server {
    pub fn endpoint(&self) -> TargetAddress {
        TargetAddress::from_host_port(&self.server, self.server_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn friendly_name(&self) -> String {
        if self.server.is_empty() {
            "New server".to_owned()
        } else if self.remarks.is_empty() {
            format!("{}:{}", self.server, self.server_port)
        } else {
            format!("{} ({}:{})", self.remarks, self.server, self.server_port)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Socks5,
    Http,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub proxy_server: String,
    #[serde(default)]
    pub proxy_port: u16,
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout: u64,
}

fn default_proxy_timeout() -> u64 {
    3
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            use_proxy: false,
            proxy_type: ProxyType::default(),
            proxy_server: String::new(),
            proxy_port: 0,
            proxy_timeout: default_proxy_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout)
    }

    pub fn endpoint(&self) -> TargetAddress {
        TargetAddress::from_host_port(&self.proxy_server, self.proxy_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
servers:
  - server: 10.0.0.1
    server_port: 8388
    password: secret
    method: aes-256-gcm
    remarks: home
  - server: tunnel.example.com
    serverPort: 443
    password: other
    method: chacha20-ietf-poly1305
    timeout: 10
index: 1
localPort: 1081
proxy:
  useProxy: true
  proxyType: http
  proxyServer: 127.0.0.1
  proxyPort: 3128
"#;

    #[test]
    fn parse_sample() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.verify().unwrap();
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.local_port, 1081);
        assert!(!cfg.share_over_lan);
        assert_eq!(cfg.listen_addr(), "127.0.0.1:1081".parse().unwrap());

        let current = cfg.current_server().unwrap();
        assert_eq!(current.server, "tunnel.example.com");
        assert_eq!(current.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.servers[0].timeout, 5);
        assert_eq!(cfg.servers[0].friendly_name(), "home (10.0.0.1:8388)");

        assert!(cfg.proxy.use_proxy);
        assert_eq!(cfg.proxy.proxy_type, ProxyType::Http);
        assert_eq!(cfg.proxy.connect_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.proxy.endpoint(), "127.0.0.1:3128".parse().unwrap());
    }

    #[test]
    fn defaults_for_empty_document() {
        let cfg = Config::from_yaml("{}").unwrap();
        cfg.verify().unwrap();
        assert_eq!(cfg.local_port, 1080);
        assert!(cfg.current_server().is_none());
        assert!(!cfg.proxy.use_proxy);
    }

    #[test]
    fn verify_rejects_bad_index() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.index = 5;
        assert!(cfg.verify().is_err());
    }

    #[test]
    fn verify_rejects_proxy_without_host() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.proxy.proxy_server.clear();
        assert!(cfg.verify().is_err());
    }
}
