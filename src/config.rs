//! Cluster and relay configuration types.
//!
//! Cluster definitions are supplied by the surrounding application (which
//! keeps them in its JSON settings); this crate only reads them. Nothing
//! here is persisted.
//!
//! # Example
//!
//! ```ignore
//! use spotlink::ClusterDef;
//!
//! let def = ClusterDef::new("VE7CC", "ve7cc.net", 23)
//!     .with_auto_login("N0CALL")
//!     .with_default_commands(["SET/SKIMMER", "SH/FILTER"]);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// ClusterDef
// ============================================================================

/// Definition of one upstream cluster endpoint.
///
/// Identity fields (`name`, `host`, `port`) are immutable for the lifetime
/// of the connection built from this definition. `auto_login`,
/// `login_call` and `default_commands` are consumed only by login replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDef {
    /// Display name, also the key for activity records ("W3LPL").
    pub name: String,

    /// Hostname or IP of the cluster node.
    pub host: String,

    /// TCP port (clusters conventionally listen on 23 or 7300).
    pub port: u16,

    /// Send the login callsign automatically after every (re)connect.
    #[serde(default)]
    pub auto_login: bool,

    /// Callsign sent in response to the login prompt.
    #[serde(default)]
    pub login_call: Option<String>,

    /// Command lines replayed after login, in order. Lines may carry
    /// `#` comments; everything from the marker onward is stripped
    /// before sending.
    #[serde(default)]
    pub default_commands: Vec<String>,
}

// ============================================================================
// Constructors
// ============================================================================

impl ClusterDef {
    /// Creates a definition with identity fields only.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            auto_login: false,
            login_call: None,
            default_commands: Vec::new(),
        }
    }

    /// Parses a definition from the JSON shape the settings layer uses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid cluster JSON: {e}")))
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClusterDef {
    /// Enables autologin with the given callsign.
    #[inline]
    #[must_use]
    pub fn with_auto_login(mut self, call: impl Into<String>) -> Self {
        self.auto_login = true;
        self.login_call = Some(call.into());
        self
    }

    /// Sets the login callsign without enabling autologin.
    #[inline]
    #[must_use]
    pub fn with_login_call(mut self, call: impl Into<String>) -> Self {
        self.login_call = Some(call.into());
        self
    }

    /// Sets the default command lines replayed after login.
    #[inline]
    #[must_use]
    pub fn with_default_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_commands = commands.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// Accessors / Validation
// ============================================================================

impl ClusterDef {
    /// Returns the `host:port` address string for TCP connect.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name or host is empty or the
    /// port is zero.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("cluster name must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config(format!(
                "cluster {}: host must not be empty",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(Error::config(format!(
                "cluster {}: port must not be zero",
                self.name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RelayConfig
// ============================================================================

/// Configuration for the local relay listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Address to bind (loopback by default; the relay serves local
    /// peers only).
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// Port to bind. Zero lets the OS pick one.
    pub port: u16,

    /// Banner line sent to every peer immediately after accept.
    #[serde(default = "default_welcome")]
    pub welcome: String,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_welcome() -> String {
    "spotlink relay ready".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: 7310,
            welcome: default_welcome(),
        }
    }
}

impl RelayConfig {
    /// Creates a loopback config on the given port.
    #[inline]
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Sets the welcome banner.
    #[inline]
    #[must_use]
    pub fn with_welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = welcome.into();
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let def = ClusterDef::new("VE7CC", "ve7cc.net", 23)
            .with_auto_login("N0CALL")
            .with_default_commands(["SH/FILTER", "# comment"]);

        assert_eq!(def.name, "VE7CC");
        assert_eq!(def.addr(), "ve7cc.net:23");
        assert!(def.auto_login);
        assert_eq!(def.login_call.as_deref(), Some("N0CALL"));
        assert_eq!(def.default_commands.len(), 2);
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let def = ClusterDef::new("", "ve7cc.net", 23);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let def = ClusterDef::new("VE7CC", "  ", 23);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let def = ClusterDef::new("VE7CC", "ve7cc.net", 0);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "name": "W3LPL",
            "host": "w3lpl.net",
            "port": 7373,
            "autoLogin": true,
            "loginCall": "N0CALL",
            "defaultCommands": ["SH/DX 10"]
        }"#;

        let def = ClusterDef::from_json(json).expect("valid JSON");
        assert_eq!(def.name, "W3LPL");
        assert_eq!(def.port, 7373);
        assert!(def.auto_login);
        assert_eq!(def.default_commands, vec!["SH/DX 10".to_string()]);
    }

    #[test]
    fn test_from_json_defaults() {
        let def = ClusterDef::from_json(r#"{"name":"A","host":"h","port":23}"#).expect("valid");
        assert!(!def.auto_login);
        assert!(def.login_call.is_none());
        assert!(def.default_commands.is_empty());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(ClusterDef::from_json("not json").is_err());
    }

    #[test]
    fn test_relay_config_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.port, 7310);
        assert!(!cfg.welcome.is_empty());
    }

    #[test]
    fn test_relay_config_builder() {
        let cfg = RelayConfig::new(0).with_welcome("hi");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.welcome, "hi");
    }
}
