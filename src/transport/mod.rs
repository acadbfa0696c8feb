//! Broker transport for site detection channels.

mod mqtt;
mod tls;

pub use mqtt::{deliver, qos_from_level, DetectionSubscriber, SubscriberHandle};
pub use tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};
