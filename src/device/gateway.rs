//! HTTP clients for a platform device gateway and the alert webhook.
//!
//! The gateway is expected to expose:
//!
//! - `GET  /position` → `{ "lat": .., "lng": .., "accuracy_m"?: .., "address"?: .. }`
//! - `POST /cameras/{facing}/acquire`, `POST /cameras/{facing}/still` (image bytes),
//!   `POST /cameras/{facing}/release`
//! - `POST /recorder/start`, `POST /recorder/finish` (video bytes)
//!
//! The alert webhook accepts one JSON POST per contact under `/messages` and
//! call requests under `/calls`. Lifeline does not specify the transport's
//! wire format beyond these bodies.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::alert::{AlertMessage, AlertTransport};
use crate::capture::{AvRecorder, CaptureProvider, CapturedClip, CapturedFrame, StillCamera};
use crate::error::{CaptureError, DeliveryError, PositionError};
use crate::location::{GeoPosition, PositionSource};
use crate::model::{Contact, SourceStream};

/// Client for a device gateway exposing position and capture devices.
#[derive(Clone)]
pub struct DeviceGatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl DeviceGatewayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PositionFix {
    lat: f64,
    lng: f64,
    accuracy_m: Option<f64>,
    address: Option<String>,
}

#[async_trait]
impl PositionSource for DeviceGatewayClient {
    async fn current_position(&self) -> Result<GeoPosition, PositionError> {
        let url = format!("{}/position", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PositionError::Unavailable(e.to_string()))?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(PositionError::Denied);
        }
        let fix = response
            .error_for_status()
            .map_err(|e| PositionError::Unavailable(e.to_string()))?
            .json::<PositionFix>()
            .await
            .map_err(|e| PositionError::Unavailable(e.to_string()))?;

        Ok(GeoPosition {
            lat: fix.lat,
            lng: fix.lng,
            accuracy_m: fix.accuracy_m,
            address: fix.address,
        })
    }
}

struct GatewayCamera {
    client: reqwest::Client,
    base_url: String,
    facing: SourceStream,
}

#[async_trait]
impl StillCamera for GatewayCamera {
    fn facing(&self) -> SourceStream {
        self.facing
    }

    async fn capture_still(&self) -> Result<CapturedFrame, CaptureError> {
        let url = format!("{}/cameras/{}/still", self.base_url, self.facing.as_str());
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| CaptureError::Failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CaptureError::Failed(e.to_string()))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CaptureError::Failed(e.to_string()))?;

        Ok(CapturedFrame {
            mime_type,
            bytes: bytes.to_vec(),
        })
    }
}

impl Drop for GatewayCamera {
    fn drop(&mut self) {
        // Best-effort device release; the gateway also reclaims leases on
        // its own timeout.
        let client = self.client.clone();
        let url = format!("{}/cameras/{}/release", self.base_url, self.facing.as_str());
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = client.post(&url).send().await;
            });
        }
    }
}

struct GatewayRecorder {
    client: reqwest::Client,
    base_url: String,
}

#[async_trait]
impl AvRecorder for GatewayRecorder {
    async fn finalize(self: Box<Self>) -> Result<CapturedClip, CaptureError> {
        let url = format!("{}/recorder/finish", self.base_url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| CaptureError::Failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CaptureError::Failed(e.to_string()))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/mp4")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CaptureError::Failed(e.to_string()))?;

        Ok(CapturedClip {
            mime_type,
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl CaptureProvider for DeviceGatewayClient {
    async fn acquire_still(
        &self,
        facing: SourceStream,
    ) -> Result<Box<dyn StillCamera>, CaptureError> {
        let url = format!("{}/cameras/{}/acquire", self.base_url, facing.as_str());
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;

        Ok(Box::new(GatewayCamera {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            facing,
        }))
    }

    async fn acquire_recorder(&self) -> Result<Box<dyn AvRecorder>, CaptureError> {
        let url = format!("{}/recorder/start", self.base_url);
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;

        Ok(Box::new(GatewayRecorder {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        }))
    }
}

/// Alert transport posting one JSON body per contact to a webhook.
#[derive(Clone)]
pub struct WebhookAlertTransport {
    client: reqwest::Client,
    base_url: String,
}

impl WebhookAlertTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OutboundAlert<'a> {
    contact: &'a Contact,
    message: &'a AlertMessage,
}

#[derive(Debug, Serialize)]
struct OutboundCall<'a> {
    number: &'a str,
}

#[async_trait]
impl AlertTransport for WebhookAlertTransport {
    async fn deliver(
        &self,
        contact: &Contact,
        message: &AlertMessage,
    ) -> Result<(), DeliveryError> {
        let url = format!("{}/messages", self.base_url);
        self.client
            .post(&url)
            .json(&OutboundAlert { contact, message })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeliveryError {
                contact_id: contact.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn place_emergency_call(&self, number: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/calls", self.base_url);
        self.client
            .post(&url)
            .json(&OutboundCall { number })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeliveryError {
                contact_id: "emergency-number".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
