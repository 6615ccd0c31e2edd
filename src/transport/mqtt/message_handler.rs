//! Pure routing of incoming hub publishes
//!
//! Every incoming topic is classified into an [`EventRoute`] before the client
//! touches any shared state, so topic parsing is testable without a broker.

use rumqttc::{Event, Packet};
use url::form_urlencoded;

/// Routing decision for one MQTT event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged
    ConnectionAcknowledged { session_present: bool },
    /// Response to a twin GET or PATCH request
    TwinResponse {
        status: u16,
        request_id: String,
        version: Option<i64>,
        payload: Vec<u8>,
    },
    /// Desired-properties patch pushed by the hub
    DesiredPatch { version: Option<i64>, payload: Vec<u8> },
    /// Direct-method invocation
    MethodRequest {
        name: String,
        request_id: String,
        payload: Vec<u8>,
    },
    /// Cloud-to-device message
    CloudToDevice {
        properties: Vec<(String, String)>,
        payload: Vec<u8>,
        pkid: u16,
    },
    /// Publish on a topic this client never subscribed to
    Unrecognized { topic: String },
    /// Broker closed the session
    Disconnected,
    /// Acks, pings and outgoing traffic
    Infrastructure,
}

/// Pure message routing decisions
pub struct MessageHandler;

impl MessageHandler {
    /// Route one event from the rumqttc event loop
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => EventRoute::ConnectionAcknowledged {
                session_present: ack.session_present,
            },
            Event::Incoming(Packet::Publish(publish)) => {
                Self::route_publish(&publish.topic, &publish.payload, publish.pkid)
            }
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            _ => EventRoute::Infrastructure,
        }
    }

    /// Classify a publish by topic
    pub fn route_publish(topic: &str, payload: &[u8], pkid: u16) -> EventRoute {
        if let Some(rest) = topic.strip_prefix("$iothub/twin/res/") {
            if let Some((status, query)) = rest.split_once('/') {
                let params = parse_query(query);
                if let (Ok(status), Some(request_id)) =
                    (status.parse::<u16>(), find(&params, "$rid"))
                {
                    return EventRoute::TwinResponse {
                        status,
                        request_id,
                        version: find(&params, "$version").and_then(|v| v.parse().ok()),
                        payload: payload.to_vec(),
                    };
                }
            }
        } else if let Some(query) = topic.strip_prefix("$iothub/twin/PATCH/properties/desired/") {
            let params = parse_query(query);
            return EventRoute::DesiredPatch {
                version: find(&params, "$version").and_then(|v| v.parse().ok()),
                payload: payload.to_vec(),
            };
        } else if let Some(rest) = topic.strip_prefix("$iothub/methods/POST/") {
            if let Some((name, query)) = rest.split_once('/') {
                if let Some(request_id) = find(&parse_query(query), "$rid") {
                    return EventRoute::MethodRequest {
                        name: name.to_string(),
                        request_id,
                        payload: payload.to_vec(),
                    };
                }
            }
        } else if let Some((_, bag)) = topic.split_once("/messages/devicebound/") {
            return EventRoute::CloudToDevice {
                properties: parse_property_bag(bag),
                payload: payload.to_vec(),
                pkid,
            };
        }

        EventRoute::Unrecognized {
            topic: topic.to_string(),
        }
    }
}

/// Decode a `k1=v1&k2=v2` property bag
pub fn parse_property_bag(bag: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(bag.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    parse_property_bag(query.strip_prefix('?').unwrap_or(query))
}

fn find(params: &[(String, String)], key: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_twin_response() {
        let route = MessageHandler::route_publish("$iothub/twin/res/204/?$rid=abc&$version=5", b"", 0);
        assert_eq!(
            route,
            EventRoute::TwinResponse {
                status: 204,
                request_id: "abc".to_string(),
                version: Some(5),
                payload: vec![],
            }
        );
    }

    #[test]
    fn test_route_desired_patch() {
        let route = MessageHandler::route_publish(
            "$iothub/twin/PATCH/properties/desired/?$version=9",
            br#"{"x":1}"#,
            0,
        );
        assert!(matches!(route, EventRoute::DesiredPatch { version: Some(9), .. }));
    }

    #[test]
    fn test_route_method_request() {
        let route = MessageHandler::route_publish("$iothub/methods/POST/IsAlive/?$rid=7", b"{}", 0);
        assert_eq!(
            route,
            EventRoute::MethodRequest {
                name: "IsAlive".to_string(),
                request_id: "7".to_string(),
                payload: b"{}".to_vec(),
            }
        );
    }

    #[test]
    fn test_route_cloud_to_device() {
        let route = MessageHandler::route_publish(
            "devices/dev-1/messages/devicebound/%24.mid=m1&%24.to=%2Fdevices%2Fdev-1&color=red",
            b"hello",
            12,
        );
        match route {
            EventRoute::CloudToDevice {
                properties,
                payload,
                pkid,
            } => {
                assert_eq!(pkid, 12);
                assert_eq!(payload, b"hello");
                assert!(properties.contains(&("$.mid".to_string(), "m1".to_string())));
                assert!(properties.contains(&("color".to_string(), "red".to_string())));
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_route_rejects_malformed_topics() {
        assert!(matches!(
            MessageHandler::route_publish("$iothub/twin/res/abc/?$rid=1", b"", 0),
            EventRoute::Unrecognized { .. }
        ));
        assert!(matches!(
            MessageHandler::route_publish("$iothub/methods/POST/IsAlive/?other=1", b"", 0),
            EventRoute::Unrecognized { .. }
        ));
        assert!(matches!(
            MessageHandler::route_publish("random/topic", b"", 0),
            EventRoute::Unrecognized { .. }
        ));
    }
}
