pub mod client;

use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};

/// Retained presence message published on `<prefix>/list/<tag>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: String,
}

impl Presence {
    pub fn new(name: &str, online: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: "switch".to_string(),
            state: if online { "online" } else { "offline" }.to_string(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct SetRequest {
    state: bool,
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    key: String,
}

/// A command decoded from one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetState(bool),
    Restart { key: String },
}

/// Decode a message. Topics other than `set` and `restart` yield `Ok(None)`.
pub fn parse_message(config: &Config, topic: &str, payload: &[u8]) -> Result<Option<Command>> {
    let is_set = topic == config.set_topic();
    if !is_set && topic != config.restart_topic() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(Error::Malformed("JSON value must be an object".into()));
    }

    let command = if is_set {
        let request: SetRequest =
            serde_json::from_value(value).map_err(|e| Error::Malformed(e.to_string()))?;
        Command::SetState(request.state)
    } else {
        let request: RestartRequest =
            serde_json::from_value(value).map_err(|e| Error::Malformed(e.to_string()))?;
        Command::Restart { key: request.key }
    };
    Ok(Some(command))
}

/// The slice of an MQTT client the session needs.
pub trait Broker {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;
    fn subscribe(&self, topic: &str) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
}

impl Broker for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.try_disconnect()?;
        Ok(())
    }
}

/// Run MQTT sessions back to back until `shutdown` turns true.
pub async fn run(config: Config, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    loop {
        match client::run_session(&config, shutdown_rx.clone()).await {
            Ok(client::SessionEnd::Shutdown) => break,
            Ok(client::SessionEnd::Restart) => info!("Session stopped by restart request"),
            Err(e) => error!("Session error: {}", e),
        }
        if *shutdown_rx.borrow() {
            break;
        }

        info!("Restarting session in {:?}", config.timing.restart_delay);
        tokio::select! {
            _ = tokio::time::sleep(config.timing.restart_delay) => {}
            Ok(_) = shutdown_rx.wait_for(|stop| *stop) => break,
        }
    }

    info!("pimote MQTT client stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::Broker;
    use crate::error::Result;

    pub const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    pub const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    const CONNECT: u8 = 0x10;
    const PUBLISH: u8 = 0x30;
    pub const DISCONNECT: u8 = 0xE0;

    /// QoS 0 PUBLISH with a body shorter than 128 bytes.
    pub fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        let mut packet = vec![PUBLISH, body.len() as u8];
        packet.extend(body);
        packet
    }

    /// One control packet as (fixed header byte, body). `None` on EOF.
    pub async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    /// Read the client's CONNECT, answer with `connack` followed by `then`,
    /// and collect everything the client sends up to DISCONNECT or EOF.
    pub async fn serve_client(
        stream: &mut TcpStream,
        connack: Option<[u8; 4]>,
        then: &[u8],
    ) -> Vec<(u8, Vec<u8>)> {
        match read_packet(stream).await {
            Some((CONNECT, _)) => {}
            _ => return Vec::new(),
        }
        if let Some(ack) = connack {
            if stream.write_all(&ack).await.is_err() || stream.write_all(then).await.is_err() {
                return Vec::new();
            }
        }
        collect_packets(stream).await
    }

    /// Everything the client sends up to DISCONNECT or EOF.
    pub async fn collect_packets(stream: &mut TcpStream) -> Vec<(u8, Vec<u8>)> {
        let mut packets = Vec::new();
        while let Some(packet) = read_packet(stream).await {
            let done = packet.0 == DISCONNECT;
            packets.push(packet);
            if done {
                break;
            }
        }
        packets
    }

    /// PUBLISH packets whose body carries `needle`.
    pub fn publishes_containing(packets: &[(u8, Vec<u8>)], needle: &str) -> usize {
        packets
            .iter()
            .filter(|(header, body)| {
                header >> 4 == PUBLISH >> 4
                    && body.windows(needle.len()).any(|w| w == needle.as_bytes())
            })
            .count()
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Publish {
            topic: String,
            payload: Vec<u8>,
            retain: bool,
        },
        Subscribe(String),
        Disconnect,
    }

    #[derive(Default)]
    pub struct RecordingBroker {
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingBroker {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn publishes_to(&self, topic: &str) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Publish { topic: t, payload, .. } if t == topic => Some(payload),
                    _ => None,
                })
                .collect()
        }
    }

    impl Broker for RecordingBroker {
        fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Publish {
                topic: topic.to_string(),
                payload,
                retain,
            });
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn disconnect(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Disconnect);
            Ok(())
        }
    }
}
