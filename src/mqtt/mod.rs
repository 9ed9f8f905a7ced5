//! MQTT plumbing shared by the gateway and the ingestion pipeline:
//! session options, the compact data payload, and the buffering
//! publisher.

use crate::config::MqttConfig;
use crate::error::{GatewayError, GatewayResult};
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use url::Url;

pub mod payload;
pub mod publisher;

/// Topic the gateway listens on for JSON write commands
/// (`$nexus/cmd/{device}/write`).
pub const CMD_WRITE_FILTER: &str = "$nexus/cmd/+/write";
/// Topic for raw-value writes (`$nexus/cmd/{device}/{tag}/set`).
pub const CMD_SET_FILTER: &str = "$nexus/cmd/+/+/set";
/// Configuration-change notifications from the config service.
pub const CONFIG_FILTER: &str = "$nexus/config/#";
/// Prefix for command responses.
pub const CMD_RESPONSE_PREFIX: &str = "$nexus/cmd/response";

/// Build rumqttc session options from our config: persistent session,
/// keep-alive, credentials, and TLS with an optional client certificate.
pub fn session_options(config: &MqttConfig) -> GatewayResult<MqttOptions> {
    let url = Url::parse(&config.broker_url)
        .map_err(|e| GatewayError::InvalidConfiguration(format!("invalid broker url: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::InvalidConfiguration("broker url has no host".into()))?;
    let tls_scheme = matches!(url.scheme(), "mqtts" | "ssl" | "tls");
    let port = url.port().unwrap_or(if tls_scheme { 8883 } else { 1883 });

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(config.clean_session);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    if config.tls.enabled || tls_scheme {
        let ca = match &config.tls.ca_path {
            Some(path) => std::fs::read(path).map_err(|e| {
                GatewayError::InvalidConfiguration(format!("reading tls ca {}: {}", path, e))
            })?,
            None => {
                return Err(GatewayError::InvalidConfiguration(
                    "tls enabled but no ca certificate configured".into(),
                ))
            }
        };
        let client_auth = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => {
                let cert = std::fs::read(cert).map_err(|e| {
                    GatewayError::InvalidConfiguration(format!("reading tls cert: {}", e))
                })?;
                let key = std::fs::read(key).map_err(|e| {
                    GatewayError::InvalidConfiguration(format!("reading tls key: {}", e))
                })?;
                Some((cert, key))
            }
            _ => None,
        };
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;

    #[test]
    fn options_from_plain_url() {
        let config = MqttConfig {
            broker_url: "mqtt://emqx.internal:1884".into(),
            client_id: "gw-1".into(),
            ..Default::default()
        };
        let options = session_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("emqx.internal".to_string(), 1884));
        assert!(!options.clean_session());
    }

    #[test]
    fn default_ports_by_scheme() {
        let config = MqttConfig {
            broker_url: "mqtt://broker".into(),
            client_id: "c".into(),
            ..Default::default()
        };
        assert_eq!(session_options(&config).unwrap().broker_address().1, 1883);
    }

    #[test]
    fn tls_without_ca_is_rejected() {
        let mut config = MqttConfig {
            broker_url: "mqtts://broker".into(),
            client_id: "c".into(),
            ..Default::default()
        };
        config.tls.enabled = true;
        assert!(session_options(&config).is_err());
    }

    #[test]
    fn bad_url_is_rejected() {
        let config = MqttConfig {
            broker_url: "not a url".into(),
            client_id: "c".into(),
            ..Default::default()
        };
        assert!(session_options(&config).is_err());
    }
}
