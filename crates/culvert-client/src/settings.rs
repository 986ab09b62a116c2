//! Virtual interface settings derived from the session configuration.

use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use culvert_proto::{key, Properties, Value};
use thiserror::Error;

/// Defaults applied for anything the session configuration omits.
pub const DEFAULT_ADDRESS: &str = "192.168.2.1";
pub const DEFAULT_NETMASK: &str = "255.255.255.0";
pub const DEFAULT_DNS: &str = "8.8.8.8";
pub const DEFAULT_OVERHEAD_BYTES: u32 = 150;

/// Errors from building or applying interface settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid interface settings: {0}")]
    Invalid(String),

    #[error("Failed to apply interface settings: {0}")]
    ApplyFailed(String),
}

/// Description of the virtual interface a session asks the host to
/// configure: tunnel-local address, netmask, DNS servers, and the
/// per-packet protocol overhead to subtract from the path MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub address: String,
    pub netmask: String,
    pub dns_servers: Vec<String>,
    pub overhead_bytes: u32,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            netmask: DEFAULT_NETMASK.to_string(),
            dns_servers: vec![DEFAULT_DNS.to_string()],
            overhead_bytes: DEFAULT_OVERHEAD_BYTES,
        }
    }
}

impl InterfaceSettings {
    /// Build settings from a session configuration table.
    ///
    /// Absent keys fall back to the defaults. Present keys must carry the
    /// right value type: `address`, `netmask`, and `dns` are strings (`dns`
    /// may be a comma-separated list), `overhead` is an integer.
    pub fn from_configuration(config: &Properties) -> Result<Self, SettingsError> {
        let mut settings = InterfaceSettings::default();

        if let Some(value) = config.get(key::ADDRESS) {
            settings.address = require_str(key::ADDRESS, value)?.to_string();
        }
        if let Some(value) = config.get(key::NETMASK) {
            settings.netmask = require_str(key::NETMASK, value)?.to_string();
        }
        if let Some(value) = config.get(key::DNS) {
            settings.dns_servers = require_str(key::DNS, value)?
                .split(',')
                .map(|server| server.trim().to_string())
                .filter(|server| !server.is_empty())
                .collect();
        }
        if let Some(value) = config.get(key::OVERHEAD) {
            let Value::Int(overhead) = value else {
                return Err(SettingsError::Invalid(format!(
                    "configuration key '{}' must be an integer",
                    key::OVERHEAD
                )));
            };
            settings.overhead_bytes = u32::try_from(*overhead).map_err(|_| {
                SettingsError::Invalid(format!("overhead {overhead} is out of range"))
            })?;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        self.address.parse::<Ipv4Addr>().map_err(|_| {
            SettingsError::Invalid(format!("bad interface address '{}'", self.address))
        })?;
        self.netmask
            .parse::<Ipv4Addr>()
            .map_err(|_| SettingsError::Invalid(format!("bad netmask '{}'", self.netmask)))?;
        for server in &self.dns_servers {
            server
                .parse::<IpAddr>()
                .map_err(|_| SettingsError::Invalid(format!("bad DNS server '{server}'")))?;
        }
        Ok(())
    }
}

fn require_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, SettingsError> {
    match value {
        Value::Str(s) => Ok(s),
        _ => Err(SettingsError::Invalid(format!(
            "configuration key '{name}' must be a string"
        ))),
    }
}

/// Applies interface settings on the host.
///
/// The engine only cares that application succeeds or fails; what applying
/// means (a TUN device, a test log, nothing at all) is the implementor's
/// business.
#[async_trait]
pub trait InterfaceConfigurator: Send + Sync + Debug {
    async fn apply(&self, settings: InterfaceSettings) -> Result<(), SettingsError>;
}
