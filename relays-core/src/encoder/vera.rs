use serde::{Deserialize, Serialize};

use crate::event::{Environment, Event, System};

const UNKNOWN_VERSION: &str = "unknown";
const PRODUCTION_CLASS: &str = "p";
const PRE_PRODUCTION_CLASS: &str = "q";

/// Deployment record accepted by vera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VeraPayload {
    pub environment: String,
    pub application: String,
    pub version: String,
    pub deployed_by: String,
    pub environment_class: String,
}

impl From<&Event> for VeraPayload {
    fn from(event: &Event) -> Self {
        VeraPayload {
            environment: environment(event),
            application: event.application.clone(),
            version: version(event),
            deployed_by: deployer(event),
            environment_class: environment_class(event).to_string(),
        }
    }
}

fn environment(event: &Event) -> String {
    if !event.skya_environment.is_empty() {
        return event.skya_environment.clone();
    }
    if event.environment() == Environment::Production && event.source() == System::Naiserator {
        return PRODUCTION_CLASS.to_string();
    }
    format!("{}:{}", event.namespace, event.cluster)
}

fn version(event: &Event) -> String {
    if event.version.is_empty() {
        UNKNOWN_VERSION.to_string()
    } else {
        event.version.clone()
    }
}

/// `<source> (<who>)` where who is the deployer name, ident or the team, in that order.
fn deployer(event: &Event) -> String {
    let source = event.source().as_str_name();
    let deployer = event.deployer_or_default();

    [deployer.name.as_str(), deployer.ident.as_str(), event.team.as_str()]
        .into_iter()
        .find(|who| !who.is_empty())
        .map_or_else(|| source.to_string(), |who| format!("{source} ({who})"))
}

fn environment_class(event: &Event) -> &'static str {
    match event.environment() {
        Environment::Production => PRODUCTION_CLASS,
        Environment::Development => PRE_PRODUCTION_CLASS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Actor, RolloutStatus};

    #[test]
    fn test_payload_from_event() {
        let tests = [
            (
                Event {
                    cluster: "dev-fss".to_string(),
                    namespace: "default".to_string(),
                    environment: Environment::Development as i32,
                    application: "app".to_string(),
                    version: "1.2.3".to_string(),
                    source: System::Naiserator as i32,
                    ..Default::default()
                },
                VeraPayload {
                    environment: "default:dev-fss".to_string(),
                    application: "app".to_string(),
                    version: "1.2.3".to_string(),
                    deployed_by: "naiserator".to_string(),
                    environment_class: "q".to_string(),
                },
            ),
            (
                Event {
                    skya_environment: "p".to_string(),
                    environment: Environment::Production as i32,
                    application: "app".to_string(),
                    version: "1.2.3".to_string(),
                    source: System::Naisd as i32,
                    deployer: Some(Actor {
                        ident: "ident".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VeraPayload {
                    environment: "p".to_string(),
                    application: "app".to_string(),
                    version: "1.2.3".to_string(),
                    deployed_by: "naisd (ident)".to_string(),
                    environment_class: "p".to_string(),
                },
            ),
            (
                Event {
                    skya_environment: "env".to_string(),
                    environment: Environment::Development as i32,
                    application: "app".to_string(),
                    version: "1.2.3".to_string(),
                    source: System::Aura as i32,
                    deployer: Some(Actor {
                        name: "name".to_string(),
                        ident: "ident".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VeraPayload {
                    environment: "env".to_string(),
                    application: "app".to_string(),
                    version: "1.2.3".to_string(),
                    deployed_by: "aura (name)".to_string(),
                    environment_class: "q".to_string(),
                },
            ),
            (
                Event {
                    skya_environment: "env".to_string(),
                    environment: Environment::Development as i32,
                    application: "app".to_string(),
                    source: System::Aura as i32,
                    deployer: Some(Actor {
                        name: "name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VeraPayload {
                    environment: "env".to_string(),
                    application: "app".to_string(),
                    version: "unknown".to_string(),
                    deployed_by: "aura (name)".to_string(),
                    environment_class: "q".to_string(),
                },
            ),
        ];

        for (event, expected) in tests {
            assert_eq!(VeraPayload::from(&event), expected);
        }
    }

    #[test]
    fn test_deployer_fallbacks() {
        let mut event = Event {
            source: System::Naiserator as i32,
            deployer: Some(Actor {
                name: "foo".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(deployer(&event), "naiserator (foo)");

        event.source = System::Naisd as i32;
        event.deployer = None;
        event.team = "bar".to_string();
        assert_eq!(deployer(&event), "naisd (bar)");

        event.team.clear();
        assert_eq!(deployer(&event), "naisd");
    }

    #[test]
    fn test_production_naiserator_environment() {
        let event = Event {
            environment: Environment::Production as i32,
            source: System::Naiserator as i32,
            rollout_status: RolloutStatus::Complete as i32,
            namespace: "default".to_string(),
            cluster: "prod-gcp".to_string(),
            ..Default::default()
        };
        let payload = VeraPayload::from(&event);
        assert_eq!(payload.environment, "p");
        assert_eq!(payload.environment_class, "p");

        // naisd deployments to production are labelled by namespace and cluster
        let event = Event {
            source: System::Naisd as i32,
            ..event
        };
        assert_eq!(VeraPayload::from(&event).environment, "default:prod-gcp");
    }

    #[test]
    fn test_payload_json_keys() {
        let json = serde_json::to_value(VeraPayload::from(&Event::default())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "environment": ":",
                "application": "",
                "version": "unknown",
                "deployedBy": "naisd",
                "environmentClass": "p",
            })
        );
    }
}
