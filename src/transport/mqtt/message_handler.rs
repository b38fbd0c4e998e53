//! Pure routing of rumqttc events
//!
//! The event loop task feeds every polled event through [`route_mqtt_event`]
//! and acts on the returned [`EventRoute`]. Keeping the decision pure makes it
//! testable without a broker.

use crate::protocol::MqttMessage;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged, ready to publish and subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Application message received on a subscribed topic
    MessageReceived(MqttMessage),
    /// Broker closed the connection
    Disconnected { reason: String },
    /// Subscription acknowledged by the broker
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event, nothing to do
    OutgoingEvent,
}

/// Route an MQTT event to the action the event loop should take
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                session_present: connack.session_present,
            },
            Packet::Publish(publish) => EventRoute::MessageReceived(MqttMessage {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                retain: publish.retain,
            }),
            Packet::Disconnect(disconnect) => EventRoute::Disconnected {
                reason: format!("{:?}", disconnect.reason_code),
            },
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                filters: suback.return_codes.len(),
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}
