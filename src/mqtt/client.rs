use std::time::Duration;

use embedded_hal::digital::OutputPin;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Broker, Command, Presence, parse_message};
use crate::config::{Config, MqttTiming};
use crate::error::{Error, Result};
use crate::relay::{self, Relay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authorizing,
    Running,
    Stopping,
}

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A restart request carried the correct key.
    Restart,
    /// The process received SIGINT/SIGTERM.
    Shutdown,
}

/// Protocol state of one broker connection and the relay it controls.
pub struct Session<B, P> {
    broker: B,
    relay: Relay<P>,
    config: Config,
    state: SessionState,
    authorized: bool,
    stopped: bool,
}

impl<B: Broker, P: OutputPin> Session<B, P> {
    pub fn new(broker: B, relay: Relay<P>, config: Config) -> Self {
        Self {
            broker,
            relay,
            config,
            state: SessionState::Connecting,
            authorized: false,
            stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn relay(&self) -> &Relay<P> {
        &self.relay
    }

    pub fn begin_authorizing(&mut self) {
        self.state = SessionState::Authorizing;
    }

    /// Handle the broker's CONNACK: announce presence and subscribe.
    pub fn on_connack(&mut self, code: ConnectReturnCode) -> Result<()> {
        if code != ConnectReturnCode::Success {
            return Err(Error::Refused(code));
        }
        info!("Authorized with MQTT broker");
        self.authorized = true;

        let online = Presence::new(&self.config.device.name, true).to_payload()?;
        self.broker
            .publish(&self.config.presence_topic(), online, true)?;
        self.broker.subscribe(&self.config.set_topic())?;
        self.broker.subscribe(&self.config.restart_topic())?;

        self.state = SessionState::Running;
        Ok(())
    }

    /// Apply an incoming message. Malformed payloads are logged and dropped.
    pub fn handle_publish(&mut self, topic: &str, payload: &[u8]) {
        if self.state != SessionState::Running {
            debug!("Ignoring message on {} while {:?}", topic, self.state);
            return;
        }

        let command = match parse_message(&self.config, topic, payload) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!("Ignoring message on unexpected topic {}", topic);
                return;
            }
            Err(e) => {
                warn!("Invalid JSON message received on {}: {}", topic, e);
                return;
            }
        };

        match command {
            Command::SetState(state) => {
                info!("Changing switch state: {}", state);
                if let Err(e) = self.relay.set(state) {
                    error!("Failed to switch relay: {}", e);
                }
            }
            Command::Restart { key } => {
                if key == self.config.device.key {
                    warn!("Server stop received with correct key");
                    self.stop();
                } else {
                    warn!("Incorrect device key on restart topic");
                }
            }
        }
    }

    /// Announce offline, release the relay and disconnect. Runs once per session.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.state = SessionState::Stopping;
        warn!("Stopping session and closing resources");

        if self.authorized {
            match Presence::new(&self.config.device.name, false).to_payload() {
                Ok(offline) => {
                    if let Err(e) = self
                        .broker
                        .publish(&self.config.presence_topic(), offline, true)
                    {
                        error!("Failed to publish offline status: {}", e);
                    }
                }
                Err(e) => error!("Failed to encode offline status: {}", e),
            }
        }
        self.relay.release();

        if self.authorized {
            if let Err(e) = self.broker.disconnect() {
                error!("Failed to disconnect: {}", e);
            }
        }
    }

    pub fn finish(&mut self) {
        self.state = SessionState::Disconnected;
        self.authorized = false;
    }
}

/// Client options carrying credentials and the offline last will.
pub fn mqtt_options(config: &Config) -> Result<MqttOptions> {
    let mut mqttopts = MqttOptions::new(
        &config.mqtt.client_id,
        &config.mqtt.broker_host,
        config.mqtt.broker_port,
    );
    mqttopts.set_keep_alive(config.mqtt.keep_alive);
    mqttopts.set_credentials(&config.mqtt.username, &config.mqtt.password);

    let offline = Presence::new(&config.device.name, false).to_payload()?;
    let lwt = rumqttc::LastWill::new(config.presence_topic(), offline, QoS::AtLeastOnce, true);
    mqttopts.set_last_will(lwt);
    Ok(mqttopts)
}

/// One full session: open the relay, connect, serve, then always tear down.
pub async fn run_session(config: &Config, mut shutdown: watch::Receiver<bool>) -> Result<SessionEnd> {
    let mut relay = relay::open(config.gpio);
    relay
        .blink(config.timing.blink_count, config.timing.blink_interval, false)
        .await;

    info!(
        "Connecting to MQTT broker {}:{} as {}",
        config.mqtt.broker_host, config.mqtt.broker_port, config.mqtt.client_id
    );
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config)?, 10);
    let mut session = Session::new(client, relay, config.clone());

    let result = drive(&mut session, &mut eventloop, &config.timing, &mut shutdown).await;

    let flush = session.is_authorized();
    session.stop();
    if flush {
        flush_disconnect(&mut eventloop, config.timing.flush_timeout).await;
    }
    session.finish();
    result
}

async fn drive<P: OutputPin>(
    session: &mut Session<AsyncClient, P>,
    eventloop: &mut EventLoop,
    timing: &MqttTiming,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd> {
    session.begin_authorizing();
    let code = tokio::select! {
        ack = tokio::time::timeout(timing.authorize_timeout, wait_for_connack(eventloop)) => {
            ack.map_err(|_| Error::Timeout("waiting for broker authorization"))??
        }
        Ok(_) = shutdown.wait_for(|stop| *stop) => return Ok(SessionEnd::Shutdown),
    };
    session.on_connack(code)?;

    let mut liveness = tokio::time::interval(timing.liveness_interval);
    loop {
        tokio::select! {
            event = eventloop.poll() => {
                if let Event::Incoming(Incoming::Publish(publish)) = event? {
                    session.handle_publish(&publish.topic, &publish.payload);
                    if session.state() == SessionState::Stopping {
                        return Ok(SessionEnd::Restart);
                    }
                }
            }
            _ = liveness.tick() => debug!("Session alive"),
            Ok(_) = shutdown.wait_for(|stop| *stop) => return Ok(SessionEnd::Shutdown),
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<ConnectReturnCode> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => return Ok(ack.code),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return Err(Error::Refused(code)),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drive the event loop until the queued offline presence and disconnect leave.
async fn flush_disconnect(eventloop: &mut EventLoop, limit: Duration) {
    let flushed = tokio::time::timeout(limit, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Event loop closed while flushing: {}", e);
                    break;
                }
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("Timed out flushing disconnect after {:?}", limit);
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::mqtt::mock::{
        CONNACK_ACCEPTED, CONNACK_NOT_AUTHORIZED, Call, DISCONNECT, RecordingBroker,
        publish_packet, publishes_containing, serve_client,
    };
    use crate::mqtt::tests::{loopback_config, test_config};
    use crate::relay::mock::RecordingPin;

    const PRESENCE: &str = "pimotev3/list/porch";
    const SET: &str = "pimotev3/set/porch";
    const RESTART: &str = "pimotev3/restart/porch";

    fn running_session() -> (Session<RecordingBroker, RecordingPin>, RecordingPin) {
        let pin = RecordingPin::default();
        let mut session = Session::new(
            RecordingBroker::default(),
            Relay::new(pin.clone()),
            test_config(),
        );
        session.begin_authorizing();
        session.on_connack(ConnectReturnCode::Success).unwrap();
        (session, pin)
    }

    fn presence_states(session: &Session<RecordingBroker, RecordingPin>) -> Vec<String> {
        session
            .broker
            .publishes_to(PRESENCE)
            .iter()
            .map(|p| serde_json::from_slice::<Presence>(p).unwrap().state)
            .collect()
    }

    #[test]
    fn connack_announces_and_subscribes() {
        let (session, _) = running_session();
        assert_eq!(session.state(), SessionState::Running);
        let calls = session.broker.calls();
        assert!(matches!(&calls[0], Call::Publish { topic, retain: true, .. } if topic == PRESENCE));
        assert_eq!(calls[1], Call::Subscribe(SET.into()));
        assert_eq!(calls[2], Call::Subscribe(RESTART.into()));
        assert_eq!(presence_states(&session), vec!["online"]);
    }

    #[test]
    fn refused_connack_fails() {
        let mut session = Session::new(
            RecordingBroker::default(),
            Relay::<RecordingPin>::disabled(),
            test_config(),
        );
        session.begin_authorizing();
        let err = session
            .on_connack(ConnectReturnCode::NotAuthorized)
            .unwrap_err();
        assert!(matches!(err, Error::Refused(ConnectReturnCode::NotAuthorized)));
        assert!(!session.is_authorized());
        assert_eq!(session.state(), SessionState::Authorizing);
    }

    #[test]
    fn set_drives_relay() {
        let (mut session, pin) = running_session();
        session.handle_publish(SET, br#"{"state": true}"#);
        session.handle_publish(SET, br#"{"state": false}"#);
        assert_eq!(pin.levels(), vec![true, false]);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn malformed_json_changes_nothing() {
        let (mut session, pin) = running_session();
        session.handle_publish(SET, br#"{"state": true}"#);
        for payload in [&b"{oops"[..], b"42", br#"{"state": 1}"#] {
            session.handle_publish(SET, payload);
            session.handle_publish(RESTART, payload);
        }
        assert_eq!(pin.levels(), vec![true]);
        assert!(session.relay().state());
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn wrong_key_keeps_running() {
        let (mut session, _) = running_session();
        session.handle_publish(RESTART, br#"{"key": "wrong"}"#);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(presence_states(&session), vec!["online"]);
        assert!(!session.broker.calls().contains(&Call::Disconnect));
    }

    #[test]
    fn correct_key_stops_and_announces_offline_once() {
        let (mut session, pin) = running_session();
        session.handle_publish(SET, br#"{"state": true}"#);
        session.handle_publish(RESTART, br#"{"key": "hunter2"}"#);
        assert_eq!(session.state(), SessionState::Stopping);

        session.handle_publish(RESTART, br#"{"key": "hunter2"}"#);
        session.stop();
        assert_eq!(presence_states(&session), vec!["online", "offline"]);
        assert_eq!(pin.levels(), vec![true, false]);

        let disconnects = session
            .broker
            .calls()
            .into_iter()
            .filter(|c| *c == Call::Disconnect)
            .count();
        assert_eq!(disconnects, 1);

        session.finish();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn stop_before_authorization_publishes_nothing() {
        let mut session = Session::new(
            RecordingBroker::default(),
            Relay::<RecordingPin>::disabled(),
            test_config(),
        );
        session.stop();
        assert!(session.broker.calls().is_empty());
    }

    #[test]
    fn last_will_is_offline_presence() {
        let options = mqtt_options(&test_config()).unwrap();
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, PRESENCE);
        assert!(will.retain);
        let presence: Presence = serde_json::from_slice(&will.message).unwrap();
        assert_eq!(presence, Presence::new("Porch Light", false));
    }

    /// Broker on a loopback port serving a single client.
    async fn fake_broker(
        connack: Option<[u8; 4]>,
        then: Vec<u8>,
    ) -> (u16, JoinHandle<Vec<(u8, Vec<u8>)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            serve_client(&mut stream, connack, &then).await
        });
        (port, broker)
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let (port, broker) = fake_broker(None, Vec::new()).await;
        let (_tx, shutdown) = watch::channel(false);
        let config = loopback_config(port, Duration::from_millis(300));

        let err = run_session(&config, shutdown).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(broker.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_connack_ends_session() {
        let (port, broker) = fake_broker(Some(CONNACK_NOT_AUTHORIZED), Vec::new()).await;
        let (_tx, shutdown) = watch::channel(false);
        let config = loopback_config(port, Duration::from_secs(2));

        let err = run_session(&config, shutdown).await.unwrap_err();
        assert!(matches!(err, Error::Refused(ConnectReturnCode::NotAuthorized)));
        assert_eq!(publishes_containing(&broker.await.unwrap(), "online"), 0);
    }

    #[tokio::test]
    async fn restart_key_flushes_offline_and_disconnect() {
        let restart = publish_packet(RESTART, br#"{"key":"hunter2"}"#);
        let (port, broker) = fake_broker(Some(CONNACK_ACCEPTED), restart).await;
        let (_tx, shutdown) = watch::channel(false);
        let config = loopback_config(port, Duration::from_secs(2));

        let end = run_session(&config, shutdown).await.unwrap();
        assert_eq!(end, SessionEnd::Restart);

        let packets = broker.await.unwrap();
        assert_eq!(publishes_containing(&packets, "online"), 1);
        assert_eq!(publishes_containing(&packets, "offline"), 1);
        assert_eq!(packets.last().map(|p| p.0), Some(DISCONNECT));
    }
}
