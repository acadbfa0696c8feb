//! Broker endpoint parsing and TLS transport for the detection subscriber.
//!
//! - `host:port`, `mqtt://`, `tcp://` connect in plain TCP unless TLS is
//!   forced by configuration.
//! - `mqtts://` and `ssl://` always use TLS.
//! - Without a CA path rumqttc loads the platform root store
//!   (`rustls-native-certs`); it panics if that store cannot be read.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// PEM material for broker TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS, always together.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read broker CA '{}'", path.display()))
            })
            .transpose()?;

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read client certificate '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("client key provided without certificate")),
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Pick the rumqttc transport for `endpoint`.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "TLS material configured but broker '{}:{}' is plain TCP; \
                     set mqtt.use_tls or use an mqtts:// address",
                    endpoint.host,
                    endpoint.port
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self
            .ca
            .clone()
            .ok_or_else(|| anyhow!("a broker CA is required when using a client certificate"))?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let mut use_tls = force_tls;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported broker scheme '{}'", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("broker address '{}' has no host", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid broker address '{}'", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing broker port in '{}'", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid broker port in '{}'", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing broker port in '{}'", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid broker port in '{}'", addr))?;
    Ok((host.to_string(), port))
}

/// Only loopback brokers are accepted unless `mqtt.allow_remote` is set.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(()),
        _ => Err(anyhow!(
            "broker {}:{} is not loopback; set mqtt.allow_remote to connect to it",
            endpoint.host,
            endpoint.port
        )),
    }
}
