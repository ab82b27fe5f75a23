//! MQTT event notifications.
//!
//! Summaries are published with QoS 1 under `<prefix>/<source_id>/event`.
//! Publishing uses `try_publish`, so a slow or unreachable broker fills the
//! client request queue and further notifications are dropped instead of
//! blocking the recorder.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, ConnectionError, Event, MqttOptions};
use rumqttc::Transport;
use std::thread::JoinHandle;
use std::time::Duration;

use super::Notifier;
use crate::EventSummary;

const REQUEST_QUEUE: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `mqtt://host:port`, `mqtts://host:port` or bare `host[:port]`.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let default_port = if use_tls { 8883 } else { 1883 };

    // [::1]:1883
    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None => default_port,
        };
        return Ok(MqttEndpoint {
            host: host.to_string(),
            port,
            use_tls,
        });
    }

    let (host, port) = match remainder.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
        ),
        None => (remainder, default_port),
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct MqttNotifier {
    client: Client,
    topic_prefix: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, REQUEST_QUEUE);
        log::info!(
            "MQTT notifications to {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.trim_end_matches('/').to_string(),
            connection_handle: Some(spawn_connection(connection)?),
        })
    }

    fn topic_for(&self, summary: &EventSummary) -> String {
        format!("{}/{}/event", self.topic_prefix, summary.source_id)
    }
}

fn spawn_connection(mut connection: Connection) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("vigil-mqtt".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(ConnectionError::RequestsDone) => break,
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        // rumqttc reconnects on the next poll; avoid spinning.
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })?;
    Ok(handle)
}

impl Notifier for MqttNotifier {
    fn notify(&mut self, summary: &EventSummary) -> Result<()> {
        let payload = serde_json::to_vec(summary)?;
        self.client
            .try_publish(self.topic_for(summary), QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish dropped: {}", e))
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.connection_handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoints() -> Result<()> {
        let plain = parse_mqtt_endpoint("mqtt://broker.local:1884")?;
        assert_eq!(plain.host, "broker.local");
        assert_eq!(plain.port, 1884);
        assert!(!plain.use_tls);

        let tls = parse_mqtt_endpoint("mqtts://broker.local")?;
        assert_eq!(tls.port, 8883);
        assert!(tls.use_tls);

        let v6 = parse_mqtt_endpoint("[::1]:1883")?;
        assert_eq!(v6.host, "::1");

        assert_eq!(parse_mqtt_endpoint("localhost")?.port, 1883);
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
        Ok(())
    }
}
