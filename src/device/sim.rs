//! Simulated devices for local runs and tests.
//!
//! These stand in for the platform when no device gateway is configured:
//! a drifting position source, cameras that produce tiny placeholder frames,
//! a recorder that returns a placeholder clip, a transport that records what
//! it would have sent, and a static contact directory. Failure toggles let
//! tests exercise the degradation paths.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use crate::alert::{AlertMessage, AlertPhase, AlertTransport};
use crate::capture::{AvRecorder, CaptureProvider, CapturedClip, CapturedFrame, StillCamera};
use crate::controller::ContactDirectory;
use crate::error::{CaptureError, DeliveryError, PositionError};
use crate::location::{GeoPosition, PositionSource};
use crate::model::{Contact, SourceStream};

/// Position source that drifts slightly around a base coordinate.
pub struct SimPositionSource {
    base_lat: f64,
    base_lng: f64,
    fixes: AtomicU64,
    denied: AtomicBool,
}

impl SimPositionSource {
    pub fn new(base_lat: f64, base_lng: f64) -> Self {
        SimPositionSource {
            base_lat,
            base_lng,
            fixes: AtomicU64::new(0),
            denied: AtomicBool::new(false),
        }
    }

    /// Simulate a revoked location permission.
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }
}

impl Default for SimPositionSource {
    fn default() -> Self {
        // Somewhere on the Champs-Élysées.
        Self::new(48.8698, 2.3078)
    }
}

#[async_trait]
impl PositionSource for SimPositionSource {
    async fn current_position(&self) -> Result<GeoPosition, PositionError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(PositionError::Denied);
        }
        let n = self.fixes.fetch_add(1, Ordering::SeqCst) as f64;
        Ok(GeoPosition {
            lat: self.base_lat + n * 1e-5,
            lng: self.base_lng + n * 5e-6,
            accuracy_m: Some(8.0),
            address: None,
        })
    }
}

struct SimCamera {
    facing: SourceStream,
}

#[async_trait]
impl StillCamera for SimCamera {
    fn facing(&self) -> SourceStream {
        self.facing
    }

    async fn capture_still(&self) -> Result<CapturedFrame, CaptureError> {
        // JPEG SOI marker plus a facing tag, enough to be a distinct payload.
        let tag = match self.facing {
            SourceStream::Front => 0x01,
            _ => 0x02,
        };
        Ok(CapturedFrame {
            mime_type: "image/jpeg".to_string(),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0, tag],
        })
    }
}

struct SimRecorder;

#[async_trait]
impl AvRecorder for SimRecorder {
    async fn finalize(self: Box<Self>) -> Result<CapturedClip, CaptureError> {
        Ok(CapturedClip {
            mime_type: "video/mp4".to_string(),
            bytes: b"ftypisom-sim-clip".to_vec(),
        })
    }
}

/// Capture provider with per-device failure toggles.
#[derive(Default)]
pub struct SimCaptureProvider {
    fail_front: AtomicBool,
    fail_rear: AtomicBool,
    fail_recorder: AtomicBool,
}

impl SimCaptureProvider {
    pub fn fail_front(&self, fail: bool) {
        self.fail_front.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rear(&self, fail: bool) {
        self.fail_rear.store(fail, Ordering::SeqCst);
    }

    pub fn fail_recorder(&self, fail: bool) {
        self.fail_recorder.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureProvider for SimCaptureProvider {
    async fn acquire_still(
        &self,
        facing: SourceStream,
    ) -> Result<Box<dyn StillCamera>, CaptureError> {
        let fail = match facing {
            SourceStream::Front => self.fail_front.load(Ordering::SeqCst),
            _ => self.fail_rear.load(Ordering::SeqCst),
        };
        if fail {
            return Err(CaptureError::SourceUnavailable(format!(
                "{} camera unavailable",
                facing.as_str()
            )));
        }
        Ok(Box::new(SimCamera { facing }))
    }

    async fn acquire_recorder(&self) -> Result<Box<dyn AvRecorder>, CaptureError> {
        if self.fail_recorder.load(Ordering::SeqCst) {
            return Err(CaptureError::SourceUnavailable("recorder unavailable".into()));
        }
        Ok(Box::new(SimRecorder))
    }
}

/// Transport that records deliveries and calls instead of sending them.
#[derive(Default)]
pub struct SimAlertTransport {
    delivered: Mutex<Vec<(String, AlertPhase)>>,
    calls: Mutex<Vec<String>>,
}

impl SimAlertTransport {
    pub fn deliveries(&self) -> Vec<(String, AlertPhase)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertTransport for SimAlertTransport {
    async fn deliver(
        &self,
        contact: &Contact,
        message: &AlertMessage,
    ) -> Result<(), DeliveryError> {
        self.delivered
            .lock()
            .unwrap()
            .push((contact.id.clone(), message.phase));
        Ok(())
    }

    async fn place_emergency_call(&self, number: &str) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push(number.to_string());
        Ok(())
    }
}

/// Fixed contact list, the same for every owner.
pub struct StaticContactDirectory {
    contacts: Vec<Contact>,
}

impl StaticContactDirectory {
    pub fn new(contacts: Vec<Contact>) -> Self {
        StaticContactDirectory { contacts }
    }
}

#[async_trait]
impl ContactDirectory for StaticContactDirectory {
    async fn contacts_for(&self, _owner_id: &str) -> Vec<Contact> {
        self.contacts.clone()
    }
}
