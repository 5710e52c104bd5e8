use std::collections::BTreeMap;

use crate::model::{CredentialMap, CredentialValue};

pub const JIRA: &str = "jira";
pub const VUSION_CLOUD: &str = "vusion_cloud";

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    required: BTreeMap<String, Vec<String>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut registry = Self {
            required: BTreeMap::new(),
        };
        registry.register(JIRA, &["url", "username", "api_token"]);
        registry.register(VUSION_CLOUD, &["url", "api_key"]);
        registry
    }
}

impl SchemaRegistry {
    pub fn register(&mut self, service: &str, required: &[&str]) {
        self.required.insert(
            service.to_string(),
            required.iter().map(|field| field.to_string()).collect(),
        );
    }

    pub fn required_fields(&self, service: &str) -> &[String] {
        self.required
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn missing_fields(&self, service: &str, map: &CredentialMap) -> Vec<String> {
        self.required_fields(service)
            .iter()
            .filter(|field| map.get(*field).is_none_or(CredentialValue::is_blank))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraCredentials {
    pub url: String,
    pub username: String,
    pub api_token: String,
    pub verify_ssl: bool,
    pub use_cert_pinning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VusionCloudCredentials {
    pub url: String,
    pub api_key: String,
    pub verify_ssl: bool,
    pub use_cert_pinning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCredentials {
    Jira(JiraCredentials),
    VusionCloud(VusionCloudCredentials),
    Generic {
        service: String,
        fields: CredentialMap,
    },
}

fn text(map: &CredentialMap, field: &str) -> String {
    map.get(field)
        .and_then(CredentialValue::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn flag(map: &CredentialMap, field: &str, default: bool) -> bool {
    map.get(field)
        .and_then(CredentialValue::as_bool)
        .unwrap_or(default)
}

impl ServiceCredentials {
    pub fn from_map(
        service: &str,
        map: &CredentialMap,
        registry: &SchemaRegistry,
    ) -> Result<Self, Vec<String>> {
        let missing = registry.missing_fields(service, map);
        if !missing.is_empty() {
            return Err(missing);
        }
        Ok(match service {
            JIRA => ServiceCredentials::Jira(JiraCredentials {
                url: text(map, "url"),
                username: text(map, "username"),
                api_token: text(map, "api_token"),
                verify_ssl: flag(map, "verify_ssl", true),
                use_cert_pinning: flag(map, "use_cert_pinning", false),
            }),
            VUSION_CLOUD => ServiceCredentials::VusionCloud(VusionCloudCredentials {
                url: text(map, "url"),
                api_key: text(map, "api_key"),
                verify_ssl: flag(map, "verify_ssl", true),
                use_cert_pinning: flag(map, "use_cert_pinning", false),
            }),
            other => ServiceCredentials::Generic {
                service: other.to_string(),
                fields: map.clone(),
            },
        })
    }

    pub fn service(&self) -> &str {
        match self {
            ServiceCredentials::Jira(_) => JIRA,
            ServiceCredentials::VusionCloud(_) => VUSION_CLOUD,
            ServiceCredentials::Generic { service, .. } => service,
        }
    }

    pub fn to_map(&self) -> CredentialMap {
        let mut map = CredentialMap::new();
        match self {
            ServiceCredentials::Jira(jira) => {
                map.insert("url".into(), jira.url.as_str().into());
                map.insert("username".into(), jira.username.as_str().into());
                map.insert("api_token".into(), jira.api_token.as_str().into());
                map.insert("verify_ssl".into(), jira.verify_ssl.into());
                map.insert("use_cert_pinning".into(), jira.use_cert_pinning.into());
            }
            ServiceCredentials::VusionCloud(vusion) => {
                map.insert("url".into(), vusion.url.as_str().into());
                map.insert("api_key".into(), vusion.api_key.as_str().into());
                map.insert("verify_ssl".into(), vusion.verify_ssl.into());
                map.insert("use_cert_pinning".into(), vusion.use_cert_pinning.into());
            }
            ServiceCredentials::Generic { fields, .. } => map.extend(fields.clone()),
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jira_map(token: &str) -> CredentialMap {
        let mut map = CredentialMap::new();
        map.insert("url".into(), "https://x.atlassian.net".into());
        map.insert("username".into(), "a@b.com".into());
        map.insert("api_token".into(), token.into());
        map
    }

    #[test]
    fn jira_requires_all_three_fields() {
        let registry = SchemaRegistry::default();
        assert!(registry.missing_fields(JIRA, &jira_map("tok123")).is_empty());
        assert_eq!(
            registry.missing_fields(JIRA, &jira_map("  ")),
            vec!["api_token".to_string()]
        );
        let mut partial = CredentialMap::new();
        partial.insert("username".into(), "a@b.com".into());
        assert_eq!(
            registry.missing_fields(JIRA, &partial),
            vec!["url".to_string(), "api_token".to_string()]
        );
    }

    #[test]
    fn typed_jira_defaults_flags() {
        let registry = SchemaRegistry::default();
        let typed = ServiceCredentials::from_map(JIRA, &jira_map("tok123"), &registry).unwrap();
        let ServiceCredentials::Jira(jira) = &typed else {
            panic!("expected jira credentials");
        };
        assert!(jira.verify_ssl);
        assert!(!jira.use_cert_pinning);
        assert_eq!(typed.service(), JIRA);
        assert_eq!(typed.to_map().get("api_token"), Some(&"tok123".into()));
    }

    #[test]
    fn unknown_services_are_generic_and_new_ones_can_register() {
        let mut registry = SchemaRegistry::default();
        let mut map = CredentialMap::new();
        map.insert("token".into(), "".into());
        let typed = ServiceCredentials::from_map("pagerduty", &map, &registry).unwrap();
        assert!(matches!(typed, ServiceCredentials::Generic { .. }));

        registry.register("pagerduty", &["token"]);
        assert_eq!(
            ServiceCredentials::from_map("pagerduty", &map, &registry).unwrap_err(),
            vec!["token".to_string()]
        );
    }
}
