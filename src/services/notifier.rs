use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::{config::ProviderConfig, error::AppError, models::sos::AlertPayload};

const PROVIDER: &str = "notification";
const MOCK_SERVICE_ID: &str = "service_mock";

/// Fan-out of an alert to a recipient list. Delivery is best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, recipients: &[String], payload: &AlertPayload)
        -> Result<(), AppError>;
}

/// Sends alert emails through the EmailJS REST API.
///
/// With the mock service id the payload is logged and nothing leaves the process.
#[derive(Clone)]
pub struct EmailJsNotifier {
    client: reqwest::Client,
    endpoint: String,
    service_id: String,
    template_id: String,
    user_id: String,
}

impl EmailJsNotifier {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: super::http_client(),
            endpoint: config.emailjs_url.clone(),
            service_id: config.emailjs_service_id.clone(),
            template_id: config.emailjs_template_id.clone(),
            user_id: config.emailjs_user_id.clone(),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.service_id == MOCK_SERVICE_ID
    }

    fn request_body(&self, recipients: &[String], payload: &AlertPayload) -> serde_json::Value {
        json!({
            "service_id": self.service_id,
            "template_id": self.template_id,
            "user_id": self.user_id,
            "template_params": {
                "user_name": payload.user_name,
                "location_link": payload.location_link,
                "timestamp": payload.timestamp,
                "trigger": payload.trigger.as_str(),
                "to_email": recipients.join(","),
            },
        })
    }
}

#[async_trait]
impl Notifier for EmailJsNotifier {
    async fn send_alert(
        &self,
        recipients: &[String],
        payload: &AlertPayload,
    ) -> Result<(), AppError> {
        let body = self.request_body(recipients, payload);
        if self.is_mock() {
            info!(recipients = recipients.len(), %body, "mock SOS email, not sent");
            return Ok(());
        }
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| AppError::unavailable(PROVIDER, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::unavailable(PROVIDER, format!("HTTP {status}")));
        }
        info!(recipients = recipients.len(), "SOS email sent");
        Ok(())
    }
}
