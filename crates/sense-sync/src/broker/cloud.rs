//! Cloud IoT provider broker.
//!
//! Authenticates with a short-lived device JWT as the MQTT password and
//! always runs over TLS. A dropped session is not retried here; the agent
//! owns the reconnect timer so each attempt gets a fresh token.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{MqttOptions, Transport};
use tracing::info;

use sense_core::{BrokerKind, CloudBrokerConfig, DeviceIdentity, Telemetry};

use super::session::{base_options, tls_configuration, MqttSession, SessionSettings};
use super::{Broker, BrokerEvents, PublishAck};
use crate::credentials::CredentialManager;
use crate::error::SyncResult;
use crate::protocol::{telemetry_text, DeviceTopics, PayloadEncoding};

/// Username the provider expects; it only reads the password.
const CLOUD_USERNAME: &str = "unused";

const CLOUD_KEEP_ALIVE: Duration = Duration::from_secs(60);

pub struct CloudBroker {
    device_id: String,
    config: CloudBrokerConfig,
    credentials: CredentialManager,
    session: MqttSession,
}

impl CloudBroker {
    pub fn new(
        identity: &DeviceIdentity,
        config: CloudBrokerConfig,
        credentials: CredentialManager,
    ) -> Self {
        let session = MqttSession::new(SessionSettings {
            kind: BrokerKind::Cloud,
            topics: DeviceTopics::for_device(&identity.device_id),
            encoding: PayloadEncoding::Plain,
            reconnect_interval: None,
        });

        CloudBroker {
            device_id: identity.device_id.clone(),
            config,
            credentials,
            session,
        }
    }

    /// Connection options carrying a currently valid token.
    fn options(&self) -> SyncResult<MqttOptions> {
        let token = self.credentials.get_token()?;

        let mut options = base_options(
            self.config.client_id(&self.device_id),
            &self.config.hostname,
            self.config.port,
        );
        options
            .set_credentials(CLOUD_USERNAME, token.signed_value)
            .set_keep_alive(CLOUD_KEEP_ALIVE)
            .set_clean_session(true)
            .set_transport(Transport::tls_with_config(tls_configuration()?));

        Ok(options)
    }
}

#[async_trait]
impl Broker for CloudBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Cloud
    }

    fn topics(&self) -> &DeviceTopics {
        &self.session.settings().topics
    }

    async fn connect(&mut self, events: BrokerEvents) -> SyncResult<()> {
        let options = self.options()?;
        info!(
            client_id = %self.config.client_id(&self.device_id),
            host = %self.config.hostname,
            port = self.config.port,
            "Connecting to cloud broker"
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerEvent;
    use crate::error::SyncError;
    use crate::testing::write_test_keys;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            app_name: "weather".into(),
            device_id: "dev-42".into(),
            device_name: "Porch".into(),
            hostname: "porch.local".into(),
        }
    }

    fn config(port: u16) -> CloudBrokerConfig {
        CloudBrokerConfig {
            hostname: "127.0.0.1".into(),
            port,
            project_id: "proj".into(),
            region: "europe-west1".into(),
            registry_id: "reg".into(),
        }
    }

    #[test]
    fn test_options_carry_identity_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let (private_key, _) = write_test_keys(dir.path());
        let broker = CloudBroker::new(
            &identity(),
            config(8883),
            CredentialManager::new("proj", private_key),
        );

        let options = broker.options().unwrap();
        assert_eq!(
            options.client_id(),
            "projects/proj/locations/europe-west1/registries/reg/devices/dev-42"
        );
        assert_eq!(options.keep_alive(), CLOUD_KEEP_ALIVE);
        assert!(matches!(options.transport(), Transport::Tls(_)));

        let (username, password) = options.credentials().unwrap();
        assert_eq!(username, "unused");
        assert_eq!(password.split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_connect_without_key_fails_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = CloudBroker::new(
            &identity(),
            config(8883),
            CredentialManager::new("proj", dir.path().join("missing.pem")),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(matches!(broker.connect(tx).await, Err(SyncError::Credential(_))));
        assert!(!broker.is_connected());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_session_reports_single_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let (private_key, _) = write_test_keys(dir.path());
        let mut broker = CloudBroker::new(
            &identity(),
            config(port),
            CredentialManager::new("proj", private_key),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        broker.connect(tx).await.unwrap();

        let mut disconnects = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(10), rx.recv()).await
        {
            if let BrokerEvent::Disconnected { requested } = event {
                assert!(!requested);
                disconnects += 1;
                break;
            }
        }
        assert_eq!(disconnects, 1);

        broker.disconnect().await;
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            broker.publish(&Telemetry::default()).await,
            Err(SyncError::NotConnected)
        ));
    }
}
