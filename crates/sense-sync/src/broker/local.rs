//! Self-hosted broker (e.g. Mosquitto on the LAN).
//!
//! No credentials, base64-framed payloads, and the session reconnects by
//! itself every 20 seconds until `disconnect()` is called.
//!
//! `ws` and `wss` reach the broker's WebSocket listener at the root path.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{MqttOptions, Transport};
use tracing::info;

use sense_core::{BrokerKind, BrokerProtocol, DeviceIdentity, LocalBrokerConfig, Telemetry};

use super::session::{base_options, tls_configuration, MqttSession, SessionSettings};
use super::{Broker, BrokerEvents, PublishAck};
use crate::error::SyncResult;
use crate::protocol::{telemetry_text, DeviceTopics, PayloadEncoding};

pub const LOCAL_KEEP_ALIVE: Duration = Duration::from_secs(10);
pub const LOCAL_RECONNECT_INTERVAL: Duration = Duration::from_secs(20);

pub struct LocalBroker {
    device_id: String,
    config: LocalBrokerConfig,
    protocol: BrokerProtocol,
    session: MqttSession,
}

impl LocalBroker {
    /// Fails when the configured protocol is not one we can speak.
    pub fn new(identity: &DeviceIdentity, config: LocalBrokerConfig) -> SyncResult<Self> {
        let protocol = config.protocol()?;

        let session = MqttSession::new(SessionSettings {
            kind: BrokerKind::Local,
            topics: DeviceTopics::for_device(&identity.device_id),
            encoding: PayloadEncoding::Base64,
            reconnect_interval: Some(LOCAL_RECONNECT_INTERVAL),
        });

        Ok(LocalBroker {
            device_id: identity.device_id.clone(),
            config,
            protocol,
            session,
        })
    }

    fn options(&self) -> SyncResult<MqttOptions> {
        let mut options = if self.protocol.is_websocket() {
            let url = format!(
                "{}://{}:{}/",
                self.protocol, self.config.hostname, self.config.port
            );
            base_options(&self.device_id, &url, self.config.port)
        } else {
            base_options(&self.device_id, &self.config.hostname, self.config.port)
        };
        options
            .set_keep_alive(LOCAL_KEEP_ALIVE)
            .set_clean_session(true);

        match self.protocol {
            BrokerProtocol::Mqtt => {}
            BrokerProtocol::Mqtts => {
                options.set_transport(Transport::tls_with_config(tls_configuration()?));
            }
            BrokerProtocol::Ws => {
                options.set_transport(Transport::Ws);
            }
            BrokerProtocol::Wss => {
                options.set_transport(Transport::wss_with_config(tls_configuration()?));
            }
        }

        Ok(options)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Local
    }

    fn topics(&self) -> &DeviceTopics {
        &self.session.settings().topics
    }

    async fn connect(&mut self, events: BrokerEvents) -> SyncResult<()> {
        info!(
            client_id = %self.device_id,
            host = %self.config.hostname,
            port = self.config.port,
            protocol = %self.protocol,
            "Connecting to local broker"
        );
        let options = self.options()?;
        self.session.start(options, events).await;
        Ok(())
    }

    async fn publish(&mut self, telemetry: &Telemetry) -> SyncResult<PublishAck> {
        let text = telemetry_text(telemetry)?;
        self.session.publish(&text)
    }

    async fn disconnect(&mut self) {
        self.session.stop().await;
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}
