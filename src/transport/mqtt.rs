//! Detection subscriber.
//!
//! Subscribes to every registered site channel and feeds each publish into
//! the `Ingestor`. Ingestion failures are logged and counted there; the
//! subscriber only reconnects on transport errors.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};
use crate::config::MqttConfig;
use crate::ingest::{IngestOutcome, Ingestor};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(anyhow!("invalid MQTT QoS level {}", other)),
    }
}

/// Hand one publish to the ingestor. Returns the outcome when accepted or
/// suppressed; rejections were already logged and counted.
pub fn deliver(ingestor: &Ingestor, topic: &[u8], payload: &[u8]) -> Option<IngestOutcome> {
    let topic = match std::str::from_utf8(topic) {
        Ok(topic) => topic,
        Err(err) => {
            log::warn!("skipping publish with non-utf8 topic: {}", err);
            return None;
        }
    };
    match ingestor.ingest(topic, payload, crate::now_utc()) {
        Ok(outcome) => {
            log::debug!("{}: {:?}", topic, outcome);
            Some(outcome)
        }
        Err(err) => {
            log::debug!("{}: {} ({})", topic, err, err.kind());
            None
        }
    }
}

pub struct DetectionSubscriber {
    endpoint: MqttEndpoint,
    materials: TlsMaterials,
    config: MqttConfig,
    qos: QoS,
    channels: Vec<String>,
    ingestor: Arc<Ingestor>,
}

impl DetectionSubscriber {
    pub fn new(config: &MqttConfig, ingestor: Arc<Ingestor>) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&config.broker, config.use_tls)?;
        if !config.allow_remote {
            validate_loopback_addr(&endpoint)?;
        }
        let materials = TlsMaterials::load(
            config.ca_path.as_deref(),
            config.client_cert_path.as_deref(),
            config.client_key_path.as_deref(),
        )?;
        let qos = qos_from_level(config.qos)?;
        let channels = ingestor.registry().channels();
        Ok(Self {
            endpoint,
            materials,
            config: config.clone(),
            qos,
            channels,
            ingestor,
        })
    }

    pub fn spawn(self) -> Result<SubscriberHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let client = Arc::new(Mutex::new(None));
        let thread_shutdown = shutdown.clone();
        let thread_client = client.clone();
        let join = std::thread::Builder::new()
            .name("mqtt-subscriber".to_string())
            .spawn(move || {
                if let Err(err) = self.run(&thread_shutdown, &thread_client) {
                    log::error!("detection subscriber stopped: {:#}", err);
                }
            })
            .context("spawn mqtt subscriber thread")?;
        Ok(SubscriberHandle {
            shutdown,
            client,
            join: Some(join),
        })
    }

    fn run(&self, shutdown: &AtomicBool, current: &Mutex<Option<Client>>) -> Result<()> {
        if self.channels.is_empty() {
            log::warn!("no sites registered; detection subscriber idle");
            return Ok(());
        }
        while !shutdown.load(Ordering::SeqCst) {
            let (client, mut connection) = self.connect()?;
            *current.lock().unwrap_or_else(|p| p.into_inner()) = Some(client.clone());
            for channel in &self.channels {
                client
                    .subscribe(channel.as_str(), self.qos)
                    .with_context(|| format!("subscribe to {}", channel))?;
            }
            log::info!(
                "subscribed to {} site channels at {:?}",
                self.channels.len(),
                self.qos
            );

            self.pump(&mut connection, shutdown);
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(RECONNECT_DELAY);
        }
        Ok(())
    }

    fn pump(&self, connection: &mut Connection, shutdown: &AtomicBool) {
        for event in connection.iter() {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    deliver(&self.ingestor, &publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                    log::warn!("broker disconnected; reconnecting");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    if !shutdown.load(Ordering::SeqCst) {
                        log::error!("MQTT connection error: {}. Reconnecting...", err);
                    }
                    return;
                }
            }
        }
        log::warn!("MQTT connection closed. Reconnecting...");
    }

    fn connect(&self) -> Result<(Client, Connection)> {
        let mut options = MqttOptions::new(
            self.config.client_id.as_str(),
            self.endpoint.host.as_str(),
            self.endpoint.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        // Keep the session so QoS 1 deliveries survive a reconnect.
        options.set_clean_start(false);
        if let Some(user) = &self.config.username {
            options.set_credentials(
                user.as_str(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options.set_transport(self.materials.build_transport(&self.endpoint)?);

        let (client, connection) = Client::new(options, 16);
        log::info!(
            "connecting to broker {}:{} (tls: {}, auth: {})",
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.use_tls,
            self.config.username.is_some()
        );
        Ok((client, connection))
    }
}

pub struct SubscriberHandle {
    shutdown: Arc<AtomicBool>,
    client: Arc<Mutex<Option<Client>>>,
    join: Option<JoinHandle<()>>,
}

impl SubscriberHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(client) = self
            .client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            if let Err(err) = client.disconnect() {
                log::debug!("broker disconnect: {}", err);
            }
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("mqtt subscriber thread panicked"))?;
        }
        Ok(())
    }
}
