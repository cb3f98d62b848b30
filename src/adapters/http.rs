//! HTTP JSON step operation.
//!
//! Posts the step input as JSON to a fixed endpoint and returns the JSON
//! response body. Any transport error or non-2xx status is a transient
//! failure left to the retry policy. Endpoints come from the `services`
//! section of the config file and replace the simulated service of their
//! plan slot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{StepInput, StepOperation};

/// Configuration for one HTTP-backed service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServiceConfig {
    pub name: String,
    pub url: String,
    /// Sent as a bearer token when set
    #[serde(default)]
    pub token: Option<String>,
}

impl HttpServiceConfig {
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.url)
            .with_context(|| format!("Invalid URL for {}: {}", self.name, self.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("{} must use http or https, got {}", self.name, url.scheme());
        }
        Ok(())
    }
}

/// HTTP endpoints by plan slot; unset slots stay simulated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpServices {
    #[serde(default)]
    pub user: Option<HttpServiceConfig>,
    #[serde(default)]
    pub order: Option<HttpServiceConfig>,
    #[serde(default)]
    pub notification: Option<HttpServiceConfig>,
    #[serde(default)]
    pub payment: Option<HttpServiceConfig>,
    #[serde(default)]
    pub recommendation: Option<HttpServiceConfig>,
}

impl HttpServices {
    /// Configured endpoints in plan order
    pub fn configured(&self) -> Vec<&HttpServiceConfig> {
        [
            &self.user,
            &self.order,
            &self.notification,
            &self.payment,
            &self.recommendation,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.configured().into_iter().try_for_each(HttpServiceConfig::validate)
    }
}

/// Step operation backed by an HTTP endpoint
pub struct HttpStepOperation {
    name: String,
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpStepOperation {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: HttpServiceConfig) -> Self {
        Self {
            token: config.token,
            ..Self::new(config.name, config.url)
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StepOperation for HttpStepOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, input: &StepInput) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", format!("{}:{}", input.process_id, self.name))
            .json(input);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {} at {}", self.name, self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {}: {}", self.name, status, body.trim());
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let op = HttpStepOperation::from_config(HttpServiceConfig {
            name: "UserService".to_string(),
            url: "http://localhost:9000/users".to_string(),
            token: Some("secret".to_string()),
        });
        assert_eq!(op.name(), "UserService");
        assert_eq!(op.url(), "http://localhost:9000/users");
        assert_eq!(op.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_services_validation() {
        let mut services = HttpServices::default();
        assert!(services.configured().is_empty());
        assert!(services.validate().is_ok());

        services.order = Some(HttpServiceConfig {
            name: "OrderService".to_string(),
            url: "https://orders.internal/api/orders".to_string(),
            token: None,
        });
        assert_eq!(services.configured().len(), 1);
        assert!(services.validate().is_ok());

        services.payment = Some(HttpServiceConfig {
            name: "PaymentService".to_string(),
            url: "ftp://payments.internal".to_string(),
            token: None,
        });
        let err = services.validate().unwrap_err();
        assert!(err.to_string().contains("PaymentService"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        // Port 9 (discard) on localhost is not expected to serve HTTP
        let op = HttpStepOperation::new("Nowhere", "http://127.0.0.1:9/step");
        let result = op.call(&StepInput::new("p1", "user-1", 0)).await;
        assert!(result.is_err());
    }
}
