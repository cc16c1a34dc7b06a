//! Verification state machine: registration, cooldown-gated monitoring and
//! attendance writes for one authenticated user.

use crate::identity::{Identity, IdentityError, IdentityProvider};
use crate::notify::{Notification, Notifier};
use crate::store::{AttendanceRecord, NewAttendance, Profile, RecordStore, StoreError};
use presence_core::descriptor::{self, DescriptorError};
use presence_core::{CosineMatcher, Descriptor, DetectionInvoker, DetectorError};
use presence_hw::{CameraError, CameraManager, Readiness, VideoConstraints};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationState {
    /// The profile has not been consulted yet.
    Unregistered,
    Registering,
    Monitoring,
}

/// Classification of every failure a session can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    DeviceUnavailable,
    DisplaySurfaceMissing,
    ModelUnavailable,
    NoFaceDetected,
    MultipleFacesDetected,
    DimensionMismatch,
    DegenerateVector,
    StoreError,
    InvalidState,
    Identity,
    Other,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Camera(#[from] CameraError),
    #[error("{0}")]
    Detection(#[from] DetectorError),
    #[error("{0}")]
    Descriptor(#[from] DescriptorError),
    #[error("record store: {0}")]
    Store(#[from] StoreError),
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: VerificationState,
    },
    #[error("camera is not active; open the camera first")]
    CameraNotActive,
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Camera(e) => camera_kind(e),
            SessionError::Detection(e) => match e {
                DetectorError::ModelUnavailable => FailureKind::ModelUnavailable,
                DetectorError::NoFaceDetected { .. } => FailureKind::NoFaceDetected,
                DetectorError::MultipleFacesDetected { .. } => FailureKind::MultipleFacesDetected,
                DetectorError::InferenceFailed(_) => FailureKind::Other,
                DetectorError::Camera(c) => camera_kind(c),
                DetectorError::Descriptor(d) => descriptor_kind(d),
            },
            SessionError::Descriptor(e) => descriptor_kind(e),
            SessionError::Store(_) => FailureKind::StoreError,
            SessionError::Identity(_) => FailureKind::Identity,
            SessionError::InvalidState { .. } => FailureKind::InvalidState,
            SessionError::CameraNotActive => FailureKind::InvalidState,
        }
    }
}

fn camera_kind(e: &CameraError) -> FailureKind {
    match e {
        CameraError::DisplaySurfaceMissing => FailureKind::DisplaySurfaceMissing,
        _ => FailureKind::DeviceUnavailable,
    }
}

fn descriptor_kind(e: &DescriptorError) -> FailureKind {
    match e {
        DescriptorError::DimensionMismatch { .. } => FailureKind::DimensionMismatch,
        DescriptorError::EmptyLandmarkSet | DescriptorError::DegenerateVector => {
            FailureKind::DegenerateVector
        }
        // A stored descriptor that no longer decodes is a store content fault.
        DescriptorError::InvalidEncoding(_) => FailureKind::StoreError,
    }
}

/// Timing knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Minimum time between two accepted attendance events.
    pub cooldown: Duration,
    /// Pause between monitoring iterations.
    pub tick_interval: Duration,
    pub constraints: VideoConstraints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
            constraints: VideoConstraints::default(),
        }
    }
}

/// Result of one monitoring iteration that did not hit an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// An accepted match was recorded too recently; detection skipped.
    CoolingDown { remaining: Duration },
    Recorded {
        record: AttendanceRecord,
        similarity: f32,
    },
    NoMatch { similarity: f32 },
    /// Capture failed; logged and swallowed.
    DetectionFailed { kind: FailureKind, reason: String },
}

/// Iteration counts from one [`AttendanceSession::run_monitoring`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub iterations: u64,
    pub recorded: u64,
    pub no_match: u64,
    pub cooling_down: u64,
    pub detection_failures: u64,
    pub errors: u64,
}

impl MonitorSummary {
    fn observe(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::CoolingDown { .. } => self.cooling_down += 1,
            TickOutcome::Recorded { .. } => self.recorded += 1,
            TickOutcome::NoMatch { .. } => self.no_match += 1,
            TickOutcome::DetectionFailed { .. } => self.detection_failures += 1,
        }
    }
}

/// One user's attendance session.
///
/// Owns the camera manager and the detection invoker for its whole
/// lifetime; every operation takes `&mut self`, so registration and
/// monitoring can never run against the same camera at once.
pub struct AttendanceSession {
    identity_provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    camera: CameraManager,
    detector: DetectionInvoker,
    matcher: CosineMatcher,
    settings: SessionSettings,
    identity: Option<Identity>,
    state: VerificationState,
    registered: Option<Descriptor>,
    last_accepted: Option<Instant>,
    cancel: CancellationToken,
}

impl AttendanceSession {
    pub fn new(
        identity_provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        camera: CameraManager,
        detector: DetectionInvoker,
        matcher: CosineMatcher,
        settings: SessionSettings,
    ) -> Self {
        Self {
            identity_provider,
            store,
            notifier,
            camera,
            detector,
            matcher,
            settings,
            identity: None,
            state: VerificationState::Unregistered,
            registered: None,
            last_accepted: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn camera_active(&self) -> bool {
        self.camera.is_active()
    }

    /// Resolve the current user and decide between registration and
    /// monitoring from their stored profile.
    pub async fn start(&mut self) -> Result<VerificationState, SessionError> {
        let result = self.load_profile().await;
        match result {
            Ok(state) => Ok(state),
            Err(e) => Err(self.surface("Session error", e)),
        }
    }

    async fn load_profile(&mut self) -> Result<VerificationState, SessionError> {
        let identity = self.identity_provider.current_identity()?;
        let profile = self.store.read_profile(&identity.user_id).await?;

        let registered = match profile.and_then(|p| p.face_descriptor) {
            Some(encoded) => match descriptor::from_transport(&encoded) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(
                        user = %identity.user_id,
                        error = %e,
                        "stored descriptor is unreadable; registration required"
                    );
                    None
                }
            },
            None => None,
        };

        self.state = if registered.is_some() {
            VerificationState::Monitoring
        } else {
            VerificationState::Registering
        };
        tracing::info!(user = %identity.user_id, state = ?self.state, "session started");

        self.registered = registered;
        self.identity = Some(identity);
        Ok(self.state)
    }

    /// Acquire the camera. Failures are notified verbatim.
    pub async fn open_camera(&mut self) -> Result<Readiness, SessionError> {
        let constraints = self.settings.constraints.clone();
        let acquired = self
            .camera
            .acquire(&constraints)
            .await
            .map(|session| session.readiness());
        acquired.map_err(|e| self.surface("Camera error", e.into()))
    }

    pub fn release_camera(&mut self) -> bool {
        self.camera.release()
    }

    /// Capture one descriptor and store it as the user's profile.
    ///
    /// On failure the state stays [`VerificationState::Registering`] so the
    /// user can retry.
    pub async fn register(&mut self) -> Result<Profile, SessionError> {
        self.require("register", VerificationState::Registering)?;

        match self.capture_and_store().await {
            Ok((profile, descriptor)) => {
                self.registered = Some(descriptor);
                self.state = VerificationState::Monitoring;
                self.notifier.notify(Notification::success(
                    "Registered",
                    "Face registered successfully",
                ));
                Ok(profile)
            }
            Err(e) => Err(self.surface("Registration failed", e)),
        }
    }

    async fn capture_and_store(&mut self) -> Result<(Profile, Descriptor), SessionError> {
        let identity = self.require_identity()?.clone();
        let descriptor = self.capture().await?;
        let encoded = descriptor::to_transport(&descriptor);
        let profile = self
            .store
            .upsert_profile(&identity.user_id, &encoded, &identity.display_name)
            .await?;
        Ok((profile, descriptor))
    }

    async fn capture(&mut self) -> Result<Descriptor, SessionError> {
        let source = self.camera.session_mut().ok_or(SessionError::CameraNotActive)?;
        Ok(self.detector.detect_one(source).await?)
    }

    /// One monitoring iteration.
    ///
    /// Detection failures come back as [`TickOutcome::DetectionFailed`];
    /// store failures are notified and returned as errors.
    pub async fn tick(&mut self) -> Result<TickOutcome, SessionError> {
        self.require("monitor", VerificationState::Monitoring)?;

        if let Some(last) = self.last_accepted {
            let since = last.elapsed();
            if since < self.settings.cooldown {
                let remaining = self.settings.cooldown - since;
                tracing::trace!(remaining_ms = remaining.as_millis() as u64, "cooldown active");
                return Ok(TickOutcome::CoolingDown { remaining });
            }
        }

        let candidate = match self.capture().await {
            Ok(d) => d,
            Err(e @ SessionError::Detection(_)) => {
                tracing::debug!(error = %e, "monitoring capture failed");
                return Ok(TickOutcome::DetectionFailed {
                    kind: e.kind(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let registered = self.registered.as_ref().ok_or(SessionError::InvalidState {
            action: "compare",
            state: self.state,
        })?;
        let result = match self.matcher.compare(&candidate, registered) {
            Ok(r) => r,
            Err(e) => {
                let e = SessionError::from(e);
                tracing::warn!(error = %e, "descriptor comparison failed");
                return Ok(TickOutcome::DetectionFailed {
                    kind: e.kind(),
                    reason: e.to_string(),
                });
            }
        };

        if !result.matched {
            tracing::debug!(similarity = result.similarity, "face did not match");
            return Ok(TickOutcome::NoMatch {
                similarity: result.similarity,
            });
        }

        let identity = self.require_identity()?.clone();
        let inserted = self
            .store
            .insert_attendance(NewAttendance {
                user_id: identity.user_id,
                display_name: identity.display_name,
            })
            .await;

        match inserted {
            Ok(record) => {
                self.last_accepted = Some(Instant::now());
                tracing::info!(
                    user = %record.user_id,
                    similarity = result.similarity,
                    "attendance accepted"
                );
                self.notifier.notify(Notification::success(
                    "Attendance recorded",
                    format!("Attendance recorded for {}", record.display_name),
                ));
                Ok(TickOutcome::Recorded {
                    record,
                    similarity: result.similarity,
                })
            }
            Err(e) => Err(self.surface("Attendance not saved", e.into())),
        }
    }

    /// Handle that stops [`run_monitoring`](Self::run_monitoring) from
    /// another task.
    pub fn monitor_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run [`tick`](Self::tick) every `tick_interval` until cancelled or the
    /// camera stream ends.
    pub async fn run_monitoring(&mut self) -> Result<MonitorSummary, SessionError> {
        if let Err(e) = self.require("monitor", VerificationState::Monitoring) {
            return Err(self.surface("Monitoring unavailable", e));
        }
        if !self.camera.is_active() {
            return Err(self.surface("Monitoring unavailable", SessionError::CameraNotActive));
        }
        if self.detector.model_name().is_none() {
            return Err(self.surface(
                "Monitoring unavailable",
                DetectorError::ModelUnavailable.into(),
            ));
        }

        let cancel = self.cancel.clone();
        let mut summary = MonitorSummary::default();
        tracing::info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            cooldown_secs = self.settings.cooldown.as_secs(),
            "monitoring started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !self.camera.is_active() {
                tracing::info!("camera session ended; monitoring stops");
                break;
            }

            summary.iterations += 1;
            match self.tick().await {
                Ok(outcome) => summary.observe(&outcome),
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(error = %e, kind = ?e.kind(), "monitoring iteration failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.tick_interval) => {}
            }
        }

        if cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        tracing::info!(?summary, "monitoring stopped");
        Ok(summary)
    }

    /// Cancel monitoring and release the camera.
    pub fn teardown(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        if self.camera.release() {
            tracing::debug!("session torn down");
        }
    }

    /// Attendance records for the current user, newest first.
    pub async fn history(&mut self, limit: usize) -> Result<Vec<AttendanceRecord>, SessionError> {
        let user_id = match &self.identity {
            Some(identity) => identity.user_id.clone(),
            None => self.identity_provider.current_identity()?.user_id,
        };
        Ok(self.store.list_attendance(&user_id, limit).await?)
    }

    fn require(&self, action: &'static str, wanted: VerificationState) -> Result<(), SessionError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    fn require_identity(&self) -> Result<&Identity, SessionError> {
        self.identity.as_ref().ok_or(SessionError::InvalidState {
            action: "act without an identity",
            state: self.state,
        })
    }

    /// Wait for notifications still being delivered in the background.
    pub async fn flush_notifications(&self) {
        self.notifier.flush().await;
    }

    /// Notify `error` verbatim and hand it back.
    fn surface(&self, title: &str, error: SessionError) -> SessionError {
        tracing::warn!(error = %error, kind = ?error.kind(), "{title}");
        self.notifier.notify(Notification::error(title, error.to_string()));
        error
    }
}

impl Drop for AttendanceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::notify::NotificationKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use presence_core::{EncodedDescriptor, FaceLandmarks, Keypoint, LandmarkModel, RetryPolicy};
    use crate::notify::PendingSends;
    use presence_hw::{Frame, MediaDevices, PreviewSurface, VideoStream};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    // --- fakes ---

    struct FakeStream {
        live: bool,
        seq: u32,
        /// Frames left before the stream ends on its own.
        frames_left: Option<u32>,
    }

    #[async_trait]
    impl VideoStream for FakeStream {
        fn label(&self) -> &str {
            "fake-camera"
        }

        fn is_live(&self) -> bool {
            self.live
        }

        async fn read_frame(&mut self) -> Result<Frame, CameraError> {
            if let Some(left) = self.frames_left.as_mut() {
                if *left == 0 {
                    self.live = false;
                    return Err(CameraError::StreamStopped);
                }
                *left -= 1;
                if *left == 0 {
                    self.live = false;
                }
            }
            self.seq += 1;
            Ok(Frame::from_gray(vec![128; 16], 4, 4, self.seq))
        }

        fn stop(&mut self) {
            self.live = false;
        }
    }

    #[derive(Default)]
    struct FakeDevices {
        deny: bool,
        frame_limit: Option<u32>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn open_video(
            &self,
            _constraints: &VideoConstraints,
        ) -> Result<Box<dyn VideoStream>, CameraError> {
            if self.deny {
                return Err(CameraError::DeviceUnavailable("permission denied".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream {
                live: true,
                seq: 0,
                frames_left: self.frame_limit,
            }))
        }
    }

    /// Returns whatever faces the test currently puts in front of it.
    #[derive(Clone, Default)]
    struct Scene {
        faces: Arc<Mutex<Vec<FaceLandmarks>>>,
        upcoming: Arc<Mutex<VecDeque<Vec<FaceLandmarks>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Scene {
        fn show(&self, faces: Vec<FaceLandmarks>) {
            *self.faces.lock().unwrap() = faces;
        }

        /// Shown for exactly one detection before falling back to `show`.
        fn show_once(&self, faces: Vec<FaceLandmarks>) {
            self.upcoming.lock().unwrap().push_back(faces);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    struct SceneModel(Scene);

    #[async_trait]
    impl LandmarkModel for SceneModel {
        fn name(&self) -> &str {
            "scene"
        }

        async fn estimate_faces(&mut self, _frame: &Frame) -> Result<Vec<FaceLandmarks>, DetectorError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(faces) = self.0.upcoming.lock().unwrap().pop_front() {
                return Ok(faces);
            }
            Ok(self.0.faces.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        profiles: Mutex<HashMap<String, Profile>>,
        attendance: Mutex<Vec<AttendanceRecord>>,
        fail_writes: AtomicBool,
    }

    impl MemoryStore {
        fn attendance_count(&self) -> usize {
            self.attendance.lock().unwrap().len()
        }

        fn write_guard(&self) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(StoreError::Rusqlite(rusqlite::Error::InvalidQuery))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn read_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
            Ok(self.profiles.lock().unwrap().get(user_id).cloned())
        }

        async fn upsert_profile(
            &self,
            user_id: &str,
            descriptor: &EncodedDescriptor,
            display_name: &str,
        ) -> Result<Profile, StoreError> {
            self.write_guard()?;
            let profile = Profile {
                user_id: user_id.to_string(),
                display_name: Some(display_name.to_string()),
                face_descriptor: Some(descriptor.clone()),
                updated_at: Utc::now(),
            };
            self.profiles
                .lock()
                .unwrap()
                .insert(user_id.to_string(), profile.clone());
            Ok(profile)
        }

        async fn insert_attendance(&self, record: NewAttendance) -> Result<AttendanceRecord, StoreError> {
            self.write_guard()?;
            let stored = AttendanceRecord {
                id: format!("rec-{}", self.attendance_count()),
                user_id: record.user_id,
                display_name: record.display_name,
                recorded_at: Utc::now(),
            };
            self.attendance.lock().unwrap().push(stored.clone());
            Ok(stored)
        }

        async fn list_attendance(
            &self,
            user_id: &str,
            limit: usize,
        ) -> Result<Vec<AttendanceRecord>, StoreError> {
            Ok(self
                .attendance
                .lock()
                .unwrap()
                .iter()
                .rev()
                .filter(|r| r.user_id == user_id)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<Notification>>);

    impl RecordingNotifier {
        fn kinds(&self) -> Vec<NotificationKind> {
            self.0.lock().unwrap().iter().map(|n| n.kind).collect()
        }

        fn last(&self) -> Option<Notification> {
            self.0.lock().unwrap().last().cloned()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification);
        }
    }

    /// Delivers from background tasks, like the desktop notifier.
    #[derive(Default)]
    struct BackgroundNotifier {
        pending: PendingSends,
        delivered: Arc<Mutex<Vec<Notification>>>,
    }

    #[async_trait]
    impl Notifier for BackgroundNotifier {
        fn notify(&self, notification: Notification) {
            let delivered = self.delivered.clone();
            self.pending.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                delivered.lock().unwrap().push(notification);
            });
        }

        async fn flush(&self) {
            self.pending.flush(Duration::from_secs(1)).await;
        }
    }

    // --- helpers ---

    fn face_at(x: f32, y: f32) -> FaceLandmarks {
        FaceLandmarks {
            keypoints: vec![Keypoint::new(x, y)],
            score: Some(0.99),
        }
    }

    /// Registered reference face: descriptor [1, 0, 0].
    fn reference_face() -> FaceLandmarks {
        face_at(1.0, 0.0)
    }

    /// Cosine 0.90 against the reference.
    fn similar_face() -> FaceLandmarks {
        face_at(0.9, 0.19f32.sqrt())
    }

    fn stranger_face() -> FaceLandmarks {
        face_at(0.0, 1.0)
    }

    struct Harness {
        session: AttendanceSession,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        devices: Arc<FakeDevices>,
        scene: Scene,
    }

    fn session_for(
        store: Arc<MemoryStore>,
        notifier: Arc<dyn Notifier>,
        devices: Arc<FakeDevices>,
        scene: &Scene,
    ) -> AttendanceSession {
        let camera = CameraManager::new(devices, Some(Box::new(PreviewSurface::new())));
        let detector = DetectionInvoker::with_model(
            Box::new(SceneModel(scene.clone())),
            RetryPolicy::default(),
        );

        AttendanceSession::new(
            Arc::new(StaticIdentity::new("alice", Some("Alice".into()))),
            store,
            notifier,
            camera,
            detector,
            CosineMatcher::default(),
            SessionSettings::default(),
        )
    }

    fn harness_on(store: Arc<MemoryStore>, devices: FakeDevices) -> Harness {
        let notifier = Arc::new(RecordingNotifier::default());
        let devices = Arc::new(devices);
        let scene = Scene::default();
        let session = session_for(store.clone(), notifier.clone(), devices.clone(), &scene);

        Harness {
            session,
            store,
            notifier,
            devices,
            scene,
        }
    }

    fn harness_with(store: Arc<MemoryStore>, deny_camera: bool) -> Harness {
        harness_on(
            store,
            FakeDevices {
                deny: deny_camera,
                ..FakeDevices::default()
            },
        )
    }

    async fn registered_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        let reference = descriptor::encode(&reference_face().keypoints).unwrap();
        store
            .upsert_profile("alice", &descriptor::to_transport(&reference), "Alice")
            .await
            .unwrap();
        store
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::default()), false)
    }

    async fn registered_harness() -> Harness {
        let mut h = harness_with(registered_store().await, false);
        assert_eq!(h.session.start().await.unwrap(), VerificationState::Monitoring);
        h.session.open_camera().await.unwrap();
        h
    }

    // --- tests ---

    #[tokio::test]
    async fn test_unregistered_user_registers_then_monitors() {
        let mut h = harness();
        assert_eq!(h.session.state(), VerificationState::Unregistered);
        assert_eq!(h.session.start().await.unwrap(), VerificationState::Registering);

        assert_eq!(h.session.open_camera().await.unwrap(), Readiness::Ready);
        h.scene.show(vec![reference_face()]);
        let profile = h.session.register().await.unwrap();

        assert_eq!(h.session.state(), VerificationState::Monitoring);
        assert!(profile.face_descriptor.is_some());
        let stored = h.store.read_profile("alice").await.unwrap().unwrap();
        assert_eq!(stored.face_descriptor, profile.face_descriptor);
        assert_eq!(stored.display_name.as_deref(), Some("Alice"));
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_registration_stays_registering() {
        let mut h = harness();
        h.session.start().await.unwrap();
        h.session.open_camera().await.unwrap();

        let err = h.session.register().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoFaceDetected);
        assert_eq!(h.session.state(), VerificationState::Registering);
        assert_eq!(h.scene.calls(), 3);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Error]);

        // Retry succeeds.
        h.scene.show(vec![reference_face()]);
        h.session.register().await.unwrap();
        assert_eq!(h.session.state(), VerificationState::Monitoring);
    }

    #[tokio::test]
    async fn test_registration_store_failure_is_surfaced() {
        let store = Arc::new(MemoryStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let mut h = harness_with(store, false);
        h.session.start().await.unwrap();
        h.session.open_camera().await.unwrap();
        h.scene.show(vec![reference_face()]);

        let err = h.session.register().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::StoreError);
        assert_eq!(h.session.state(), VerificationState::Registering);
        assert_eq!(h.notifier.last().unwrap().kind, NotificationKind::Error);
    }

    #[tokio::test]
    async fn test_register_requires_registering_state() {
        let mut h = registered_harness().await;
        let err = h.session.register().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidState);
    }

    #[tokio::test]
    async fn test_register_without_camera() {
        let mut h = harness();
        h.session.start().await.unwrap();
        let err = h.session.register().await.unwrap_err();
        assert!(matches!(err, SessionError::CameraNotActive));
        assert_eq!(err.kind(), FailureKind::InvalidState);
    }

    #[tokio::test]
    async fn test_matching_face_records_once_then_cools_down() {
        let mut h = registered_harness().await;
        h.scene.show(vec![similar_face()]);

        let first = h.session.tick().await.unwrap();
        match first {
            TickOutcome::Recorded { similarity, ref record } => {
                assert!((similarity - 0.9).abs() < 1e-4);
                assert_eq!(record.user_id, "alice");
                assert_eq!(record.display_name, "Alice");
            }
            other => panic!("expected a record, got {other:?}"),
        }

        let calls_after_match = h.scene.calls();
        let second = h.session.tick().await.unwrap();
        assert!(matches!(second, TickOutcome::CoolingDown { .. }));
        assert_eq!(h.store.attendance_count(), 1);
        // Cooldown skips detection entirely.
        assert_eq!(h.scene.calls(), calls_after_match);
    }

    #[tokio::test]
    async fn test_stranger_does_not_match() {
        let mut h = registered_harness().await;
        h.scene.show(vec![stranger_face()]);

        let outcome = h.session.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::NoMatch { similarity } if similarity.abs() < 1e-6));
        assert_eq!(h.store.attendance_count(), 0);
    }

    #[tokio::test]
    async fn test_two_faces_in_monitoring_is_swallowed() {
        let mut h = registered_harness().await;
        h.scene.show(vec![similar_face(), stranger_face()]);

        let outcome = h.session.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::DetectionFailed {
                kind: FailureKind::MultipleFacesDetected,
                ..
            }
        ));
        assert_eq!(h.store.attendance_count(), 0);
        assert!(h.notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_attendance_store_failure_is_notified_and_keeps_cooldown_clear() {
        let mut h = registered_harness().await;
        h.scene.show(vec![similar_face()]);
        h.store.fail_writes.store(true, Ordering::SeqCst);

        let err = h.session.tick().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::StoreError);
        assert_eq!(h.notifier.last().unwrap().kind, NotificationKind::Error);

        h.store.fail_writes.store(false, Ordering::SeqCst);
        assert!(matches!(h.session.tick().await.unwrap(), TickOutcome::Recorded { .. }));
    }

    #[tokio::test]
    async fn test_denied_camera_creates_no_session() {
        let mut h = harness_with(Arc::new(MemoryStore::default()), true);
        h.session.start().await.unwrap();

        let err = h.session.open_camera().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::DeviceUnavailable);
        assert!(!h.session.camera_active());
        let note = h.notifier.last().unwrap();
        assert_eq!(note.kind, NotificationKind::Error);
        assert_eq!(note.description, "camera unavailable: permission denied");
    }

    #[tokio::test]
    async fn test_monitoring_refuses_without_camera() {
        let mut h = harness_with(registered_store().await, false);
        h.session.start().await.unwrap();

        let err = h.session.run_monitoring().await.unwrap_err();
        assert!(matches!(err, SessionError::CameraNotActive));
        assert_eq!(err.kind(), FailureKind::InvalidState);
        assert_eq!(h.scene.calls(), 0);
        let note = h.notifier.last().unwrap();
        assert_eq!(note.title, "Monitoring unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_ends_when_stream_runs_dry() {
        // One frame for readiness, then two for detection.
        let devices = FakeDevices {
            frame_limit: Some(3),
            ..FakeDevices::default()
        };
        let mut h = harness_on(registered_store().await, devices);
        h.session.start().await.unwrap();
        h.session.open_camera().await.unwrap();
        h.scene.show(vec![stranger_face()]);

        let summary = tokio::time::timeout(Duration::from_secs(60), h.session.run_monitoring())
            .await
            .expect("loop must end without cancellation")
            .unwrap();

        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.no_match, 2);
        assert_eq!(summary.errors, 0);
        assert!(!h.session.camera_active());

        let calls = h.scene.calls();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.scene.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_continues_after_multiple_faces() {
        let mut h = registered_harness().await;
        h.scene.show_once(vec![similar_face(), stranger_face()]);
        h.scene.show(vec![similar_face()]);
        let handle = h.session.monitor_handle();

        let (summary, _) = tokio::join!(h.session.run_monitoring(), async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            handle.cancel();
        });
        let summary = summary.unwrap();

        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.detection_failures, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.cooling_down, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(h.store.attendance_count(), 1);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_second_record_within_cooldown() {
        let mut h = registered_harness().await;
        h.scene.show(vec![similar_face()]);
        let handle = h.session.monitor_handle();

        let (summary, _) = tokio::join!(h.session.run_monitoring(), async {
            tokio::time::sleep(Duration::from_secs(299)).await;
            handle.cancel();
        });
        let summary = summary.unwrap();

        assert_eq!(h.store.attendance_count(), 1);
        assert_eq!(summary.recorded, 1);
        assert!(summary.cooling_down >= 290);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_again_after_cooldown() {
        let mut h = registered_harness().await;
        h.scene.show(vec![similar_face()]);
        let handle = h.session.monitor_handle();

        let (summary, _) = tokio::join!(h.session.run_monitoring(), async {
            tokio::time::sleep(Duration::from_secs(305)).await;
            handle.cancel();
        });

        assert_eq!(summary.unwrap().recorded, 2);
        let history = h.session.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.user_id == "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_loop_runs_no_further_iterations() {
        let mut h = registered_harness().await;
        h.scene.show(vec![stranger_face()]);
        let handle = h.session.monitor_handle();

        let (summary, _) = tokio::join!(h.session.run_monitoring(), async {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            handle.cancel();
        });
        let summary = summary.unwrap();
        let calls = h.scene.calls();
        assert_eq!(summary.iterations, 4);
        assert_eq!(summary.no_match, 4);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.scene.calls(), calls);

        // A fresh handle is issued for the next run.
        assert!(!h.session.monitor_handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_teardown_releases_camera() {
        let mut h = registered_harness().await;
        let handle = h.session.monitor_handle();
        assert!(h.session.camera_active());

        h.session.teardown();
        assert!(handle.is_cancelled());
        assert!(!h.session.camera_active());
        assert!(!h.session.release_camera());

        let err = h.session.run_monitoring().await.unwrap_err();
        assert!(matches!(err, SessionError::CameraNotActive));
        assert_eq!(err.kind(), FailureKind::InvalidState);
    }

    #[tokio::test]
    async fn test_reopening_camera_replaces_session() {
        let mut h = registered_harness().await;
        h.session.open_camera().await.unwrap();
        assert_eq!(h.devices.opened.load(Ordering::SeqCst), 2);
        assert!(h.session.camera_active());
    }

    #[tokio::test]
    async fn test_unreadable_stored_descriptor_requires_registration() {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert_profile("alice", &EncodedDescriptor::from("%%%".to_string()), "Alice")
            .await
            .unwrap();
        let mut h = harness_with(store, false);
        assert_eq!(h.session.start().await.unwrap(), VerificationState::Registering);
    }

    #[test]
    fn test_failure_kinds() {
        let e = SessionError::from(CameraError::DisplaySurfaceMissing);
        assert_eq!(e.kind(), FailureKind::DisplaySurfaceMissing);
        let e = SessionError::from(DetectorError::Camera(CameraError::StreamStopped));
        assert_eq!(e.kind(), FailureKind::DeviceUnavailable);
        let e = SessionError::from(DescriptorError::DimensionMismatch { left: 3, right: 15 });
        assert_eq!(e.kind(), FailureKind::DimensionMismatch);
        let e = SessionError::from(DetectorError::Descriptor(DescriptorError::EmptyLandmarkSet));
        assert_eq!(e.kind(), FailureKind::DegenerateVector);
        // Using the camera before opening it is a sequencing fault, not a device fault.
        assert_eq!(SessionError::CameraNotActive.kind(), FailureKind::InvalidState);
    }

    #[test]
    fn test_camera_failure_notice_survives_runtime_shutdown() {
        let notifier = Arc::new(BackgroundNotifier::default());
        let scene = Scene::default();
        let devices = Arc::new(FakeDevices {
            deny: true,
            ..FakeDevices::default()
        });
        let mut session = session_for(
            Arc::new(MemoryStore::default()),
            notifier.clone(),
            devices,
            &scene,
        );

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt.block_on(async {
            session.start().await.unwrap();
            let err = session.open_camera().await.unwrap_err();
            session.flush_notifications().await;
            err
        });
        drop(rt);

        assert_eq!(err.kind(), FailureKind::DeviceUnavailable);
        let delivered = notifier.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].title, "Camera error");
        assert_eq!(delivered[0].description, "camera unavailable: permission denied");
    }
}
