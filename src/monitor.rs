//! Monitor task: owns the session and runs its effects
//!
//! One task holds the state machine, the level estimator, the detector and
//! the display latch. Commands, audio frames, countdown ticks, dispatch
//! results and location fixes are all serialised through its select loop,
//! so the session has exactly one writer. Callers talk to it through a
//! cloneable [`MonitorHandle`].

use crate::config::MonitorConfig;
use crate::detector::{Detection, DetectionState, DisplayLatch, ThresholdDetector};
use crate::dispatcher::{AlertDispatcher, DispatchError, DispatchRequest};
use crate::events::{AudioFrame, LifecycleEvent};
use crate::incident::{IncidentId, IncidentRecord};
use crate::level::LevelEstimator;
use crate::location::{Coordinates, LocationWatch};
use crate::sampler::Sampler;
use crate::services::Credential;
use crate::session::{
    Effect, EmergencySession, EmergencyStateMachine, SessionEvent, SessionStatus, Transition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const FRAME_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 128;
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor task is not running")]
    Closed,

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(f32),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Point-in-time view of the monitor
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub session: EmergencySession,
    pub current_db: f32,
    pub display_latched: bool,
    pub detection: DetectionState,
    pub threshold_db: f32,
    pub sampling: bool,
}

impl MonitorSnapshot {
    pub fn status(&self) -> SessionStatus {
        self.session.status
    }
}

enum Command {
    Session(SessionEvent, oneshot::Sender<Transition>),
    SetThreshold(f32),
    Snapshot(oneshot::Sender<MonitorSnapshot>),
    History(oneshot::Sender<std::result::Result<Vec<IncidentRecord>, DispatchError>>),
}

/// Cloneable handle to a running monitor
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<LifecycleEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MonitorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub async fn start_monitoring(&self) -> Result<Transition> {
        self.session(SessionEvent::StartMonitoring).await
    }

    pub async fn stop_monitoring(&self) -> Result<Transition> {
        self.session(SessionEvent::StopMonitoring).await
    }

    pub async fn manual_sos(&self) -> Result<Transition> {
        self.session(SessionEvent::ManualSos).await
    }

    /// Abort a running countdown. `Applied` guarantees the countdown will
    /// never trigger; `Ignored` means there was nothing to cancel (it may
    /// already have fired).
    pub async fn cancel(&self) -> Result<Transition> {
        self.session(SessionEvent::Cancel).await
    }

    pub async fn mark_safe(&self) -> Result<Transition> {
        self.session(SessionEvent::MarkSafe).await
    }

    pub async fn dismiss(&self) -> Result<Transition> {
        self.session(SessionEvent::Dismiss).await
    }

    pub async fn retry(&self) -> Result<Transition> {
        self.session(SessionEvent::Retry).await
    }

    /// Change the trigger threshold; the debounce counter is kept.
    pub async fn set_threshold(&self, threshold_db: f32) -> Result<()> {
        if !threshold_db.is_finite() || threshold_db < 0.0 {
            return Err(MonitorError::InvalidThreshold(threshold_db));
        }
        self.send(Command::SetThreshold(threshold_db)).await
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| MonitorError::Closed)
    }

    /// Incident history of the session owner, most recent first
    pub async fn history(&self) -> Result<Vec<IncidentRecord>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::History(tx)).await?;
        Ok(rx.await.map_err(|_| MonitorError::Closed)??)
    }

    /// Ask the task to stop; pair with awaiting its `JoinHandle`.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Resolves once the monitor has run `event` through the state machine.
    async fn session(&self, event: SessionEvent) -> Result<Transition> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Session(event, tx)).await?;
        rx.await.map_err(|_| MonitorError::Closed)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MonitorError::Closed)
    }
}

/// The session owner; consumed by [`Monitor::spawn`]
pub struct Monitor {
    fsm: EmergencyStateMachine,
    estimator: LevelEstimator,
    detector: ThresholdDetector,
    latch: DisplayLatch,
    current_db: f32,

    sampler: Box<dyn Sampler>,
    frames: Option<mpsc::Receiver<AudioFrame>>,

    countdown: Option<(u64, Interval)>,

    dispatcher: Arc<AlertDispatcher>,
    credential: Option<Credential>,
    results_tx: mpsc::UnboundedSender<SessionEvent>,
    results_rx: mpsc::UnboundedReceiver<SessionEvent>,

    location_watch: Option<LocationWatch>,
    location_tx: mpsc::UnboundedSender<Coordinates>,
    location_rx: mpsc::UnboundedReceiver<Coordinates>,
    watch_interval: Duration,
    location_timeout: Duration,

    events: broadcast::Sender<LifecycleEvent>,
}

impl Monitor {
    pub fn new(
        config: &MonitorConfig,
        dispatcher: Arc<AlertDispatcher>,
        sampler: Box<dyn Sampler>,
        credential: Option<Credential>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (location_tx, location_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            fsm: EmergencyStateMachine::new(config.countdown_seconds),
            estimator: LevelEstimator::new(config.gain_multiplier, config.db_offset),
            detector: ThresholdDetector::new(config.threshold_db, config.required_consecutive_frames),
            latch: DisplayLatch::new(config.threshold_db),
            current_db: 0.0,
            sampler,
            frames: None,
            countdown: None,
            dispatcher,
            credential,
            results_tx,
            results_rx,
            location_watch: None,
            location_tx,
            location_rx,
            watch_interval: config.location_watch_interval(),
            location_timeout: config.location_timeout(),
            events,
        }
    }

    /// Start the task. It runs until [`MonitorHandle::shutdown`].
    pub fn spawn(self) -> (MonitorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = MonitorHandle {
            commands: commands_tx,
            events: self.events.clone(),
            shutdown: Arc::new(shutdown_tx),
        };
        let join = tokio::spawn(self.run(commands_rx, shutdown_rx));
        (handle, join)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        info!("Monitor started");

        loop {
            tokio::select! {
                // Frames ahead of commands: a snapshot reflects every frame queued before it
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                frame = next_frame(&mut self.frames), if self.frames.is_some() => {
                    match frame {
                        Some(frame) => self.on_frame(frame),
                        None => self.on_sampler_lost(),
                    }
                }

                generation = next_tick(&mut self.countdown), if self.countdown.is_some() => {
                    self.apply(SessionEvent::Tick { generation });
                }

                Some(result) = self.results_rx.recv() => {
                    self.apply(result);
                }

                Some(coords) = self.location_rx.recv() => {
                    self.apply(SessionEvent::LocationUpdated(coords));
                }

                Some(command) = commands.recv() => {
                    self.on_command(command);
                }
            }
        }

        self.release_sampler();
        self.location_watch = None;
        info!("Monitor shutting down");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Session(event, reply) => {
                let transition = self.apply(event);
                let _ = reply.send(transition);
            }
            Command::SetThreshold(threshold_db) => {
                info!(threshold_db, "Threshold changed");
                self.detector.set_threshold(threshold_db);
                self.latch.set_threshold(threshold_db);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::History(reply) => {
                let dispatcher = self.dispatcher.clone();
                let credential = self.credential.clone();
                tokio::spawn(async move {
                    let _ = reply.send(dispatcher.history(credential.as_ref()).await);
                });
            }
        }
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        let sample = self.estimator.sample(&frame);
        let db = sample.calibrated_db;
        self.current_db = db;
        self.latch.update(db);

        match self.fsm.status() {
            SessionStatus::Monitoring => {
                self.apply(SessionEvent::Level { db });
                if let Detection::Sustained = self.detector.push(db) {
                    self.apply(SessionEvent::Sustained { db });
                }
            }
            SessionStatus::Warning => {
                self.apply(SessionEvent::Level { db });
            }
            _ => {}
        }
    }

    fn on_sampler_lost(&mut self) {
        warn!("Audio input closed");
        self.release_sampler();
        self.emit(LifecycleEvent::SamplerUnavailable {
            reason: "audio input closed".to_string(),
        });
    }

    fn release_sampler(&mut self) {
        // Receiver first so the sampler thread sees a closed channel
        self.frames = None;
        self.sampler.stop();
        self.current_db = 0.0;
        self.latch.reset();
    }

    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            session: self.fsm.session().clone(),
            current_db: self.current_db,
            display_latched: self.latch.is_latched(),
            detection: self.detector.state(),
            threshold_db: self.detector.threshold_db(),
            sampling: self.frames.is_some(),
        }
    }

    fn apply(&mut self, event: SessionEvent) -> Transition {
        let transition = self.fsm.on_event(event);
        for effect in self.fsm.drain_effects() {
            self.execute(effect);
        }
        transition
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::StartSampling => {
                let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
                match self.sampler.start(tx) {
                    Ok(()) => self.frames = Some(rx),
                    Err(e) => {
                        error!("Could not start audio sampling: {}", e);
                        self.frames = None;
                        self.emit(LifecycleEvent::SamplerUnavailable {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Effect::StopSampling => self.release_sampler(),
            Effect::ResetDetector => self.detector.reset(),
            Effect::StartCountdown { generation, seconds } => {
                debug!(generation, seconds, "Countdown started");
                let interval = interval_at(Instant::now() + COUNTDOWN_TICK, COUNTDOWN_TICK);
                self.countdown = Some((generation, interval));
            }
            Effect::StopCountdown => {
                self.countdown = None;
            }
            Effect::Dispatch {
                manual,
                decibel_level,
                last_known_location,
            } => {
                let request = DispatchRequest {
                    credential: self.credential.clone(),
                    decibel_level,
                    manual,
                    last_known_location,
                };
                let dispatcher = self.dispatcher.clone();
                let results = self.results_tx.clone();
                tokio::spawn(async move {
                    let event = match dispatcher.dispatch(request).await {
                        Ok(report) => SessionEvent::DispatchSucceeded {
                            contacts_attempted: report.attempted(),
                            contacts_failed: report.failed(),
                            incident_id: report.incident.id,
                        },
                        Err(e) => SessionEvent::DispatchFailed {
                            reason: e.to_string(),
                        },
                    };
                    let _ = results.send(event);
                });
            }
            Effect::Resolve { incident_id } => self.spawn_resolve(incident_id),
            Effect::StartLocationWatch => {
                if self.location_watch.is_none() {
                    self.location_watch = Some(LocationWatch::spawn(
                        self.dispatcher.location_provider().clone(),
                        self.watch_interval,
                        self.location_timeout,
                        self.location_tx.clone(),
                    ));
                }
            }
            Effect::StopLocationWatch => {
                if self.location_watch.take().is_some() {
                    debug!("Location watch stopped");
                }
            }
            Effect::Emit(event) => self.emit(event),
        }
    }

    fn spawn_resolve(&self, incident_id: IncidentId) {
        let dispatcher = self.dispatcher.clone();
        let credential = self.credential.clone();
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let event = match dispatcher.resolve(credential.as_ref(), &incident_id).await {
                Ok(_) => SessionEvent::ResolveSucceeded,
                Err(e) => SessionEvent::ResolveFailed {
                    reason: e.to_string(),
                },
            };
            let _ = results.send(event);
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(countdown: &mut Option<(u64, Interval)>) -> u64 {
    match countdown {
        Some((generation, interval)) => {
            interval.tick().await;
            *generation
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, UserProfile};
    use crate::dispatcher::DispatchConfig;
    use crate::incident::IncidentStatus;
    use crate::location::{FixedLocation, LocationProvider, NoLocation};
    use crate::notify::LogNotifier;
    use crate::sampler::SamplerError;
    use crate::services::{Contact, IncidentStore};
    use std::sync::Mutex as StdMutex;

    /// Sampler whose frames are pushed by the test
    #[derive(Clone, Default)]
    struct ManualSampler {
        feed: Arc<StdMutex<Option<mpsc::Sender<AudioFrame>>>>,
        denied: bool,
    }

    impl ManualSampler {
        fn denied() -> Self {
            Self {
                denied: true,
                ..Default::default()
            }
        }

        fn running(&self) -> bool {
            self.feed.lock().unwrap().is_some()
        }

        async fn push(&self, amplitude: f32, count: usize) {
            let tx = self.feed.lock().unwrap().clone().expect("sampler running");
            for _ in 0..count {
                tx.send(AudioFrame::new(vec![amplitude; 64])).await.unwrap();
            }
        }

        fn unplug(&self) {
            self.feed.lock().unwrap().take();
        }
    }

    impl Sampler for ManualSampler {
        fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> std::result::Result<(), SamplerError> {
            if self.denied {
                return Err(SamplerError::PermissionDenied);
            }
            *self.feed.lock().unwrap() = Some(frames);
            Ok(())
        }

        fn stop(&mut self) {
            self.feed.lock().unwrap().take();
        }

        fn is_running(&self) -> bool {
            self.running()
        }
    }

    // Default gain 50: 0.5 reads ~128 dB, 1e-5 reads ~34 dB
    const LOUD: f32 = 0.5;
    const QUIET: f32 = 1e-5;

    struct Fixture {
        handle: MonitorHandle,
        join: JoinHandle<()>,
        events: broadcast::Receiver<LifecycleEvent>,
        sampler: ManualSampler,
        backend: Arc<MemoryBackend>,
        credential: Credential,
    }

    async fn fixture_with(
        sampler: ManualSampler,
        location: Arc<dyn LocationProvider>,
        credential: Option<Credential>,
    ) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let registered = backend
            .register(
                UserProfile::new("u1", "Priya", "priya@example.com")
                    .with_contact(Contact::new("Mom", "mom@example.com"))
                    .with_contact(Contact::new("Dad", "dad@example.com")),
                "tok",
            )
            .await;
        let config = MonitorConfig::default();
        let dispatcher = Arc::new(AlertDispatcher::new(
            DispatchConfig::from(&config),
            backend.clone(),
            backend.clone(),
            Arc::new(LogNotifier),
            location,
        ));
        let monitor = Monitor::new(
            &config,
            dispatcher,
            Box::new(sampler.clone()),
            credential.or(Some(registered.clone())),
        );
        let (handle, join) = monitor.spawn();
        let events = handle.subscribe();
        Fixture {
            handle,
            join,
            events,
            sampler,
            backend,
            credential: registered,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(ManualSampler::default(), Arc::new(NoLocation), None).await
    }

    async fn start(f: &mut Fixture) {
        f.handle.start_monitoring().await.unwrap();
        next_matching(&mut f.events, |e| *e == LifecycleEvent::MonitoringStarted).await;
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<LifecycleEvent>, pred: F) -> LifecycleEvent
    where
        F: Fn(&LifecycleEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    }

    fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_noise_escalates_after_countdown() {
        let mut f = fixture().await;
        start(&mut f).await;
        assert!(f.sampler.running());

        let started = Instant::now();
        f.sampler.push(LOUD, 5).await;
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Warning { countdown_seconds: 10 })).await;

        let sent = next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Sent { .. })).await;
        assert!(started.elapsed() >= Duration::from_secs(10));
        let LifecycleEvent::Sent { incident_id, contacts_attempted, .. } = sent else {
            unreachable!()
        };
        assert_eq!(contacts_attempted, 2);

        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), SessionStatus::Sent);
        assert!(!snapshot.session.trigger_is_manual);
        assert_eq!(snapshot.session.incident_id, Some(incident_id));

        let history = f.backend.list_incidents(&f.credential).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].decibel_level > 100.0);
        assert!(history[0].contacts_notified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_spikes_do_not_warn() {
        let mut f = fixture().await;
        start(&mut f).await;

        for _ in 0..5 {
            f.sampler.push(LOUD, 4).await;
            f.sampler.push(QUIET, 1).await;
        }
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), SessionStatus::Monitoring);
        assert_eq!(snapshot.detection.consecutive_loud_frames, 0);
        assert!(snapshot.current_db < 80.0);
        assert!(!drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Warning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_escalation() {
        let mut f = fixture().await;
        start(&mut f).await;
        f.sampler.push(LOUD, 5).await;
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Warning { .. })).await;

        // Let a few ticks pass first
        next_matching(&mut f.events, |e| *e == LifecycleEvent::CountdownTick { remaining: 7 }).await;
        assert_eq!(f.handle.cancel().await.unwrap(), Transition::Applied);
        next_matching(&mut f.events, |e| *e == LifecycleEvent::Cancelled).await;

        tokio::time::sleep(Duration::from_secs(30)).await;

        let after = drain(&mut f.events);
        assert!(!after.iter().any(|e| matches!(e, LifecycleEvent::Triggered { .. })));
        assert!(!after.iter().any(|e| matches!(e, LifecycleEvent::CountdownTick { .. })));
        assert_eq!(f.handle.snapshot().await.unwrap().status(), SessionStatus::Monitoring);
        assert!(f.backend.list_incidents(&f.credential).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_at_final_tick_is_all_or_nothing() {
        let mut f = fixture().await;
        start(&mut f).await;
        f.sampler.push(LOUD, 5).await;
        next_matching(&mut f.events, |e| *e == LifecycleEvent::CountdownTick { remaining: 1 }).await;

        // Wake at the same instant as the last tick
        tokio::time::sleep(COUNTDOWN_TICK).await;
        let ack = f.handle.cancel().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let events = drain(&mut f.events);
        let cancelled = events.contains(&LifecycleEvent::Cancelled);
        let triggered = events
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Triggered { .. }));
        assert_ne!(cancelled, triggered, "{events:?}");
        assert_eq!(ack == Transition::Applied, cancelled);

        let incidents = f.backend.list_incidents(&f.credential).await.unwrap();
        assert_eq!(incidents.len(), usize::from(triggered));
        let expected = if cancelled {
            SessionStatus::Monitoring
        } else {
            SessionStatus::Sent
        };
        assert_eq!(f.handle.snapshot().await.unwrap().status(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_report_ignored_transitions() {
        let mut f = fixture().await;
        assert_eq!(f.handle.cancel().await.unwrap(), Transition::Ignored);
        assert_eq!(f.handle.manual_sos().await.unwrap(), Transition::Applied);
        // Triggered already: nothing left to cancel
        assert_eq!(f.handle.cancel().await.unwrap(), Transition::Ignored);

        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Sent { .. })).await;
        assert_eq!(f.handle.dismiss().await.unwrap(), Transition::Ignored);
        assert_eq!(f.handle.snapshot().await.unwrap().status(), SessionStatus::Sent);
        assert!(!drain(&mut f.events).contains(&LifecycleEvent::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sos_from_idle_is_immediate() {
        let mut f = fixture().await;
        let started = Instant::now();
        f.handle.manual_sos().await.unwrap();

        let triggered = next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Triggered { .. })).await;
        assert_eq!(triggered, LifecycleEvent::Triggered { manual: true });
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Sent { .. })).await;
        assert!(started.elapsed() < COUNTDOWN_TICK);

        let history = f.handle.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decibel_level, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_safe_resolves_and_stops_sampling() {
        let mut f = fixture().await;
        f.handle.start_monitoring().await.unwrap();
        f.handle.manual_sos().await.unwrap();
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Sent { .. })).await;
        assert!(f.sampler.running());

        f.handle.mark_safe().await.unwrap();
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Resolved { .. })).await;
        assert!(!f.sampler.running());

        let history = f.handle.history().await.unwrap();
        assert_eq!(history[0].status, IncidentStatus::Resolved);

        f.handle.dismiss().await.unwrap();
        next_matching(&mut f.events, |e| *e == LifecycleEvent::Dismissed).await;
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), SessionStatus::Idle);
        assert!(!snapshot.sampling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_fails_and_can_be_dismissed() {
        let mut f = fixture_with(
            ManualSampler::default(),
            Arc::new(NoLocation),
            Some(Credential::bearer("revoked")),
        )
        .await;
        f.handle.manual_sos().await.unwrap();
        let failed = next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Failed { .. })).await;
        let LifecycleEvent::Failed { reason } = failed else { unreachable!() };
        assert!(reason.contains("Token invalid"), "{reason}");

        f.handle.retry().await.unwrap();
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Failed { .. })).await;

        f.handle.dismiss().await.unwrap();
        next_matching(&mut f.events, |e| *e == LifecycleEvent::Dismissed).await;
        assert_eq!(f.handle.snapshot().await.unwrap().status(), SessionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_microphone_degrades() {
        let mut f = fixture_with(ManualSampler::denied(), Arc::new(NoLocation), None).await;
        f.handle.start_monitoring().await.unwrap();
        let event = next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::SamplerUnavailable { .. })).await;
        assert!(matches!(event, LifecycleEvent::SamplerUnavailable { reason } if reason.contains("permission")));

        // Manual SOS still works without audio
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), SessionStatus::Monitoring);
        assert!(!snapshot.sampling);
        f.handle.manual_sos().await.unwrap();
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Sent { .. })).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplugged_sampler_is_reported() {
        let mut f = fixture().await;
        start(&mut f).await;
        f.sampler.push(LOUD, 2).await;
        assert!(f.handle.snapshot().await.unwrap().display_latched);
        f.sampler.unplug();

        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::SamplerUnavailable { .. })).await;
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), SessionStatus::Monitoring);
        assert!(!snapshot.sampling);
        assert_eq!(snapshot.current_db, 0.0);
        assert!(!snapshot.display_latched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_watch_feeds_session() {
        let mut f = fixture_with(
            ManualSampler::default(),
            Arc::new(FixedLocation::new(12.97, 77.59, 9.0)),
            None,
        )
        .await;
        f.handle.manual_sos().await.unwrap();
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::Sent { .. })).await;
        // The watch keeps polling while the incident is open
        next_matching(&mut f.events, |e| matches!(e, LifecycleEvent::LocationUpdated(_))).await;

        let snapshot = f.handle.snapshot().await.unwrap();
        let known = snapshot.session.last_known_location.expect("location recorded");
        assert_eq!(known.latitude, 12.97);

        let history = f.backend.list_incidents(&f.credential).await.unwrap();
        assert_eq!(history[0].location.unwrap().lng, 77.59);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_change_applies_to_detector() {
        let mut f = fixture().await;
        assert!(matches!(
            f.handle.set_threshold(f32::NAN).await,
            Err(MonitorError::InvalidThreshold(_))
        ));
        f.handle.set_threshold(150.0).await.unwrap();
        start(&mut f).await;
        f.sampler.push(LOUD, 10).await;

        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.threshold_db, 150.0);
        assert_eq!(snapshot.status(), SessionStatus::Monitoring);
        assert!(!snapshot.display_latched);
        assert!(!drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Warning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_task_and_releases_sampler() {
        let f = fixture().await;
        f.handle.start_monitoring().await.unwrap();
        f.handle.snapshot().await.unwrap();
        assert!(f.sampler.running());

        f.handle.shutdown();
        f.join.await.unwrap();
        assert!(!f.sampler.running());
        assert_eq!(f.handle.snapshot().await.unwrap_err(), MonitorError::Closed);
    }
}
