use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Application registration accepted by nora. Every field is required by the API,
/// missing values are sent as empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoraPayload {
    pub name: String,
    pub team: String,
    pub cluster: String,
    pub zone: String,
    pub source: String,
}

impl From<&Event> for NoraPayload {
    fn from(event: &Event) -> Self {
        NoraPayload {
            name: event.application.clone(),
            team: event.team.clone(),
            cluster: event.cluster.clone(),
            zone: zone(&event.cluster).to_string(),
            source: event.source().as_str_name().to_string(),
        }
    }
}

/// Zone part of cluster names such as `prod-fss` or `dev-gcp`.
pub fn zone(cluster: &str) -> &str {
    let mut tokens = cluster.split('-');
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(_), Some(zone), None) => zone,
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::System;

    #[test]
    fn test_payload_from_event() {
        let tests = [
            (
                Event {
                    application: "nora".to_string(),
                    cluster: "prod-fss".to_string(),
                    source: System::Naiserator as i32,
                    team: "myteam".to_string(),
                    ..Default::default()
                },
                NoraPayload {
                    name: "nora".to_string(),
                    team: "myteam".to_string(),
                    cluster: "prod-fss".to_string(),
                    zone: "fss".to_string(),
                    source: "naiserator".to_string(),
                },
            ),
            (
                Event {
                    application: "foo".to_string(),
                    cluster: "foobar-gcp".to_string(),
                    source: System::Naisd as i32,
                    team: "bar".to_string(),
                    ..Default::default()
                },
                NoraPayload {
                    name: "foo".to_string(),
                    team: "bar".to_string(),
                    cluster: "foobar-gcp".to_string(),
                    zone: "gcp".to_string(),
                    source: "naisd".to_string(),
                },
            ),
            (
                Event {
                    source: System::Aura as i32,
                    ..Default::default()
                },
                NoraPayload {
                    name: String::new(),
                    team: String::new(),
                    cluster: String::new(),
                    zone: String::new(),
                    source: "aura".to_string(),
                },
            ),
        ];

        for (event, expected) in tests {
            assert_eq!(NoraPayload::from(&event), expected);
        }
    }

    #[test]
    fn test_zone() {
        assert_eq!(zone("prod-fss"), "fss");
        assert_eq!(zone("foobar-gcp"), "gcp");
        assert_eq!(zone("dev-gcp-2"), "");
        assert_eq!(zone("local"), "");
        assert_eq!(zone(""), "");
        assert_eq!(zone("prod-"), "");
    }

    #[test]
    fn test_payload_json_keys() {
        let payload = NoraPayload::from(&Event {
            application: "app".to_string(),
            cluster: "dev-gcp".to_string(),
            team: "aura".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "app",
                "team": "aura",
                "cluster": "dev-gcp",
                "zone": "gcp",
                "source": "naisd",
            })
        );
    }
}
