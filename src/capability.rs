//! Capability Adapters
//!
//! Uniform interface over external productivity services. Adapters are
//! stateless per call, must return within the caller's timeout budget, and
//! never raise unclassified errors: every failure mode maps into the
//! closed `ToolErrorKind` set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ToolErrorKind;

/// Closed set of external capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Calendar,
    Mail,
    Drive,
    Contacts,
    Weather,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Mail => "mail",
            Self::Drive => "drive",
            Self::Contacts => "contacts",
            Self::Weather => "weather",
        }
    }

    /// How the synthesizer refers to this capability in front of the user.
    pub fn user_facing(&self) -> &'static str {
        match self {
            Self::Calendar => "your calendar",
            Self::Mail => "your mail",
            Self::Drive => "your documents",
            Self::Contacts => "your contacts",
            Self::Weather => "the weather service",
        }
    }

    /// Attributed cost of one invocation, USD. Drives budget reservations.
    pub fn cost_usd(&self) -> f64 {
        match self {
            Self::Calendar | Self::Mail | Self::Drive | Self::Contacts => 0.002,
            Self::Weather => 0.001,
        }
    }

    /// Delegated-auth scope the user must have granted.
    pub fn required_scope(&self) -> Option<&'static str> {
        match self {
            Self::Calendar => Some("calendar.read"),
            Self::Mail => Some("mail.read"),
            Self::Drive => Some("drive.read"),
            Self::Contacts => Some("contacts.read"),
            Self::Weather => None,
        }
    }
}

/// Outcome of one capability invocation: structured data or a classified
/// failure. Never an unhandled error.
pub type InvokeResult = Result<Value, ToolErrorKind>;

/// External-service integration point.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    async fn invoke(&self, params: &Value, auth_grant: Option<&str>) -> InvokeResult;
}

/// Registry mapping capabilities to their adapters. Built once at startup;
/// the executor looks adapters up per action.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Capability, Arc<dyn CapabilityAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Capability, adapter: Arc<dyn CapabilityAdapter>) {
        self.adapters.insert(capability, adapter);
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn CapabilityAdapter>> {
        self.adapters.get(&capability).cloned()
    }
}

/// Current-weather adapter backed by the OpenWeather HTTP API.
/// Params: `{"location": "<city>"}`.
pub struct WeatherAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct OwmResponse {
    weather: Vec<OwmWeather>,
    main: OwmMain,
}

#[derive(Deserialize)]
struct OwmWeather {
    description: String,
}

#[derive(Deserialize)]
struct OwmMain {
    temp: f64,
}

impl WeatherAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, "https://api.openweathermap.org/data/2.5/weather")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl CapabilityAdapter for WeatherAdapter {
    async fn invoke(&self, params: &Value, _auth_grant: Option<&str>) -> InvokeResult {
        let location = params
            .get("location")
            .and_then(|v| v.as_str())
            .ok_or(ToolErrorKind::NotFound)?;

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", location), ("appid", &self.api_key), ("units", "metric")])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolErrorKind::Timeout
                } else {
                    ToolErrorKind::Unknown
                }
            })?;

        match response.status().as_u16() {
            200 => {}
            401 | 403 => return Err(ToolErrorKind::AuthDenied),
            404 => return Err(ToolErrorKind::NotFound),
            429 => return Err(ToolErrorKind::RateLimited),
            _ => return Err(ToolErrorKind::Unknown),
        }

        let body: OwmResponse = response.json().await.map_err(|_| ToolErrorKind::Unknown)?;
        let description = body
            .weather
            .first()
            .map(|w| w.description.clone())
            .unwrap_or_else(|| "unknown conditions".to_string());

        Ok(serde_json::json!({
            "location": location,
            "description": description,
            "temp_c": body.main.temp,
            "summary": format!("Weather in {}: {}, {:.0}°C", location, description, body.main.temp),
        }))
    }
}

/// Adapter for delegated-auth productivity services (calendar, mail,
/// drive, contacts). Each capability maps to one route under a gateway
/// base URL; the user's delegated credential is forwarded as a bearer
/// token and never stored here.
pub struct DelegatedHttpAdapter {
    capability: Capability,
    base_url: String,
    client: reqwest::Client,
}

impl DelegatedHttpAdapter {
    pub fn new(capability: Capability, base_url: &str) -> Self {
        Self {
            capability,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CapabilityAdapter for DelegatedHttpAdapter {
    async fn invoke(&self, params: &Value, auth_grant: Option<&str>) -> InvokeResult {
        let Some(token) = auth_grant else {
            return Err(ToolErrorKind::AuthDenied);
        };

        let url = format!("{}/{}", self.base_url, self.capability.as_str());
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolErrorKind::Timeout
                } else {
                    ToolErrorKind::Unknown
                }
            })?;

        match response.status().as_u16() {
            200 => response.json().await.map_err(|_| ToolErrorKind::Unknown),
            401 | 403 => Err(ToolErrorKind::AuthDenied),
            404 => Err(ToolErrorKind::NotFound),
            408 => Err(ToolErrorKind::Timeout),
            429 => Err(ToolErrorKind::RateLimited),
            _ => Err(ToolErrorKind::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAdapter;

    #[async_trait]
    impl CapabilityAdapter for EchoAdapter {
        async fn invoke(&self, params: &Value, _auth: Option<&str>) -> InvokeResult {
            Ok(params.clone())
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register(Capability::Calendar, Arc::new(EchoAdapter));

        assert!(registry.get(Capability::Calendar).is_some());
        assert!(registry.get(Capability::Mail).is_none());
    }

    #[tokio::test]
    async fn test_weather_adapter_rejects_missing_location() {
        let adapter = WeatherAdapter::with_base_url("key", "http://localhost:1/none");
        let result = adapter.invoke(&serde_json::json!({}), None).await;
        assert_eq!(result.unwrap_err(), ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delegated_adapter_requires_credential() {
        let adapter = DelegatedHttpAdapter::new(Capability::Calendar, "http://localhost:1");
        let result = adapter.invoke(&serde_json::json!({}), None).await;
        assert_eq!(result.unwrap_err(), ToolErrorKind::AuthDenied);
    }

    #[test]
    fn test_scopes_only_on_delegated_capabilities() {
        assert_eq!(Capability::Calendar.required_scope(), Some("calendar.read"));
        assert_eq!(Capability::Weather.required_scope(), None);
    }

    #[test]
    fn test_every_capability_has_positive_cost() {
        for cap in [
            Capability::Calendar,
            Capability::Mail,
            Capability::Drive,
            Capability::Contacts,
            Capability::Weather,
        ] {
            assert!(cap.cost_usd() > 0.0);
        }
    }
}
