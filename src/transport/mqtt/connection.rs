//! Pure connection configuration for the rumqttc-backed client
//!
//! Turns [`ManagedClientOptions`] into rumqttc [`MqttOptions`]. No I/O happens
//! here apart from reading credential environment variables.

use crate::config::ManagedClientOptions;
use crate::transport::ClientError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Largest packet the client accepts from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Host, port and TLS flag extracted from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Default port for a URL scheme
pub fn default_port(scheme: &str) -> u16 {
    if scheme == "mqtts" {
        8883
    } else {
        1883
    }
}

/// Parse a broker URL such as `mqtt://localhost:1883`
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, ClientError> {
    let url = Url::parse(broker_url)
        .map_err(|e| ClientError::InvalidOptions(format!("invalid broker URL '{broker_url}': {e}")))?;

    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        other => {
            return Err(ClientError::InvalidOptions(format!(
                "unsupported broker URL scheme '{other}'"
            )));
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| ClientError::InvalidOptions(format!("broker URL '{broker_url}' has no host")))?;
    let port = url.port().unwrap_or_else(|| default_port(url.scheme()));

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Build rumqttc options from managed client options
pub fn configure_mqtt_options(options: &ManagedClientOptions) -> Result<MqttOptions, ClientError> {
    let address = parse_broker_url(&options.connection.broker_url)?;
    let mut mqtt_options = MqttOptions::new(
        options.connection.client_id.clone(),
        address.host,
        address.port,
    );

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = options.get_mqtt_username() {
        let password = options.get_mqtt_password().unwrap_or_default();
        mqtt_options.set_credentials(&username, &password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(options.connection.keep_alive_secs));
    mqtt_options.set_clean_start(options.connection.clean_start);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}
