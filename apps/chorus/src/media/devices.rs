//! Local capture devices and the preferences that pick between them.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{LocalTrack, TrackRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Microphone,
    Camera,
    Display,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Microphone => "microphone",
            DeviceKind::Camera => "camera",
            DeviceKind::Display => "display",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission to use the {0} was denied")]
    PermissionDenied(DeviceKind),
    #[error("no {0} available")]
    NotFound(DeviceKind),
    #[error("device {device} cannot satisfy the requested constraints")]
    Overconstrained { device: String },
    #[error("{0} is in use by another application")]
    Busy(DeviceKind),
    #[error("capture cancelled")]
    Cancelled,
}

#[async_trait]
pub trait CaptureDevices: Send + Sync {
    fn list(&self, kind: DeviceKind) -> Vec<DeviceInfo>;
    /// `None` selects the system default device.
    async fn open_microphone(&self, device_id: Option<&str>) -> Result<LocalTrack, CaptureError>;
    async fn open_camera(&self, device_id: Option<&str>) -> Result<LocalTrack, CaptureError>;
    /// Opens a display capture, plus its system audio when requested and
    /// available.
    async fn open_display(
        &self,
        with_audio: bool,
    ) -> Result<(LocalTrack, Option<LocalTrack>), CaptureError>;
    /// Most recent raw sample window of a local audio track.
    fn sample_window(&self, track: &LocalTrack) -> Option<Vec<f32>>;
}

/// Storage boundary for the user's preferred devices.
pub trait DevicePreferences: Send + Sync {
    fn preferred(&self, kind: DeviceKind) -> Option<String>;
    fn set_preferred(&self, kind: DeviceKind, device_id: Option<String>);
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    inner: Mutex<HashMap<DeviceKind, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DevicePreferences for MemoryPreferences {
    fn preferred(&self, kind: DeviceKind) -> Option<String> {
        self.inner.lock().get(&kind).cloned()
    }

    fn set_preferred(&self, kind: DeviceKind, device_id: Option<String>) {
        let mut guard = self.inner.lock();
        match device_id {
            Some(id) => guard.insert(kind, id),
            None => guard.remove(&kind),
        };
    }
}

/// Opens the preferred microphone.
///
/// A preferred device that can no longer satisfy its constraints falls back
/// to the system default and the preference is cleared. Any other failure is
/// returned to the caller untouched.
pub async fn acquire_microphone(
    devices: &dyn CaptureDevices,
    prefs: &dyn DevicePreferences,
    cancel: &CancellationToken,
) -> Result<LocalTrack, CaptureError> {
    acquire(devices, DeviceKind::Microphone, prefs, cancel).await
}

pub async fn acquire_camera(
    devices: &dyn CaptureDevices,
    prefs: &dyn DevicePreferences,
    cancel: &CancellationToken,
) -> Result<LocalTrack, CaptureError> {
    acquire(devices, DeviceKind::Camera, prefs, cancel).await
}

async fn open_kind(
    devices: &dyn CaptureDevices,
    kind: DeviceKind,
    device: Option<&str>,
) -> Result<LocalTrack, CaptureError> {
    match kind {
        DeviceKind::Microphone => devices.open_microphone(device).await,
        DeviceKind::Camera => devices.open_camera(device).await,
        DeviceKind::Display => devices.open_display(false).await.map(|(video, _)| video),
    }
}

async fn acquire(
    devices: &dyn CaptureDevices,
    kind: DeviceKind,
    prefs: &dyn DevicePreferences,
    cancel: &CancellationToken,
) -> Result<LocalTrack, CaptureError> {
    let preferred = prefs.preferred(kind);
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
        result = open_kind(devices, kind, preferred.as_deref()) => result,
    };
    match (first, preferred) {
        (Err(CaptureError::Overconstrained { device }), Some(_)) => {
            warn!(
                target = "chorus::media::devices",
                %kind,
                device = %device,
                "preferred device overconstrained; using default"
            );
            prefs.set_preferred(kind, None);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CaptureError::Cancelled),
                result = open_kind(devices, kind, None) => result,
            }
        }
        (result, _) => result,
    }
}

#[derive(Debug)]
struct SyntheticState {
    devices: Vec<DeviceInfo>,
    failures: HashMap<DeviceKind, CaptureError>,
    input_level: f32,
    opened: usize,
}

/// Device set that fabricates tracks and a sine-wave microphone signal.
#[derive(Debug)]
pub struct SyntheticDevices {
    state: Mutex<SyntheticState>,
}

const SAMPLE_WINDOW: usize = 480;

impl Default for SyntheticDevices {
    fn default() -> Self {
        let device = |id: &str, label: &str, kind| DeviceInfo {
            id: id.to_string(),
            label: label.to_string(),
            kind,
        };
        Self {
            state: Mutex::new(SyntheticState {
                devices: vec![
                    device("mic-default", "Synthetic Microphone", DeviceKind::Microphone),
                    device("cam-default", "Synthetic Camera", DeviceKind::Camera),
                    device("display-0", "Synthetic Display", DeviceKind::Display),
                ],
                failures: HashMap::new(),
                input_level: 0.0,
                opened: 0,
            }),
        }
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, kind: DeviceKind, id: &str, label: &str) {
        self.state.lock().devices.push(DeviceInfo {
            id: id.to_string(),
            label: label.to_string(),
            kind,
        });
    }

    /// Makes every subsequent open of `kind` fail with `error`.
    pub fn fail(&self, kind: DeviceKind, error: CaptureError) {
        self.state.lock().failures.insert(kind, error);
    }

    pub fn recover(&self, kind: DeviceKind) {
        self.state.lock().failures.remove(&kind);
    }

    /// Peak amplitude of the synthetic microphone signal.
    pub fn set_input_level(&self, level: f32) {
        self.state.lock().input_level = level.clamp(0.0, 1.0);
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    fn open(
        &self,
        kind: DeviceKind,
        role: TrackRole,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, CaptureError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failures.get(&kind) {
            return Err(error.clone());
        }
        let (device, label) = match device_id {
            Some(id) => state
                .devices
                .iter()
                .find(|device| device.kind == kind && device.id == id)
                .map(|device| (device.id.clone(), device.label.clone()))
                .ok_or_else(|| CaptureError::Overconstrained {
                    device: id.to_string(),
                })?,
            None => state
                .devices
                .iter()
                .find(|device| device.kind == kind)
                .map(|device| (device.id.clone(), device.label.clone()))
                .ok_or(CaptureError::NotFound(kind))?,
        };
        let track = LocalTrack::new(role, label);
        state.opened += 1;
        info!(
            target = "chorus::media::devices",
            %kind,
            device = %device,
            track_id = %track.id(),
            "opened synthetic device"
        );
        Ok(track)
    }
}

#[async_trait]
impl CaptureDevices for SyntheticDevices {
    fn list(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        self.state
            .lock()
            .devices
            .iter()
            .filter(|device| device.kind == kind)
            .cloned()
            .collect()
    }

    async fn open_microphone(&self, device_id: Option<&str>) -> Result<LocalTrack, CaptureError> {
        self.open(DeviceKind::Microphone, TrackRole::Microphone, device_id)
    }

    async fn open_camera(&self, device_id: Option<&str>) -> Result<LocalTrack, CaptureError> {
        self.open(DeviceKind::Camera, TrackRole::Camera, device_id)
    }

    async fn open_display(
        &self,
        with_audio: bool,
    ) -> Result<(LocalTrack, Option<LocalTrack>), CaptureError> {
        let video = self.open(DeviceKind::Display, TrackRole::Screen, None)?;
        let audio = with_audio.then(|| LocalTrack::new(TrackRole::ScreenAudio, "Synthetic Display Audio"));
        Ok((video, audio))
    }

    fn sample_window(&self, track: &LocalTrack) -> Option<Vec<f32>> {
        if track.role() != TrackRole::Microphone {
            return None;
        }
        let level = if track.is_enabled() {
            self.state.lock().input_level
        } else {
            0.0
        };
        Some(
            (0..SAMPLE_WINDOW)
                .map(|i| level * (TAU * i as f32 / 48.0).sin())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overconstrained_preference_falls_back_and_is_cleared() {
        let devices = SyntheticDevices::new();
        let prefs = MemoryPreferences::new();
        prefs.set_preferred(DeviceKind::Microphone, Some("usb-headset".into()));

        let track = acquire_microphone(&devices, &prefs, &CancellationToken::new())
            .await
            .expect("fallback to default");
        assert_eq!(track.label(), "Synthetic Microphone");
        assert_eq!(prefs.preferred(DeviceKind::Microphone), None);
    }

    #[tokio::test]
    async fn permission_denied_is_not_retried() {
        let devices = SyntheticDevices::new();
        devices.fail(
            DeviceKind::Microphone,
            CaptureError::PermissionDenied(DeviceKind::Microphone),
        );
        let prefs = MemoryPreferences::new();
        let err = acquire_microphone(&devices, &prefs, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::PermissionDenied(DeviceKind::Microphone));
        assert_eq!(devices.opened(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquisition_reports_cancelled() {
        let devices = SyntheticDevices::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = acquire_microphone(&devices, &MemoryPreferences::new(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::Cancelled);
    }

    #[test]
    fn muted_microphone_produces_silence() {
        let devices = SyntheticDevices::new();
        devices.set_input_level(0.8);
        let track = LocalTrack::new(TrackRole::Microphone, "mic");
        track.set_enabled(false);
        let window = devices.sample_window(&track).expect("mic window");
        assert!(window.iter().all(|sample| *sample == 0.0));
    }
}
