//! Lifecycle glue between a host component and a playing music event.
//!
//! The host drives [`TimelineBridge::initialize`], [`TimelineBridge::begin`],
//! [`TimelineBridge::tick`] and [`TimelineBridge::shutdown`] from its update
//! thread. The audio engine reports beats and markers from its own thread
//! through the callback installed at initialization, which resolves the
//! instance's user data through the shared [`TimelineRegistry`].

use std::fmt;
use std::sync::Arc;

use crate::audio::{
    AudioBackend, CallbackKind, CallbackMask, CallbackStatus, EngineError, InstanceCallback,
    InstanceHandle, StopMode,
};
use crate::decoder::decode;
use crate::diagnostics::DiagnosticsSink;
use crate::events::{BeatEvent, MarkerEvent, TimelineEvent, TimelineEvents};
use crate::timeline::{SharedTimeline, TimelineInfo, TimelineKey, TimelineRegistry};
use crate::{Result, SyncError};

/// Lifecycle position of a [`TimelineBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Created, no instance yet.
    Uninitialized,
    /// Instance created and wired to the record, not started.
    Initialized,
    /// Playback requested; ticks and callbacks update the record.
    Playing,
    /// Shut down. Terminal.
    Stopped,
}

impl BridgeState {
    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Playing => "playing",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiving end of the engine callback. Cloned into the closure handed to
/// the engine; holds no reference to the bridge itself.
#[derive(Debug, Clone)]
pub struct TimelineCallbackHandler {
    registry: Arc<TimelineRegistry>,
    events: TimelineEvents,
}

impl TimelineCallbackHandler {
    /// Entry point for engine callbacks. Always reports
    /// [`CallbackStatus::Ok`]; local failures are logged.
    pub fn handle(
        &self,
        backend: &dyn AudioBackend,
        instance: InstanceHandle,
        kind: &CallbackKind,
    ) -> CallbackStatus {
        let key = match backend.user_data(instance) {
            Ok(Some(key)) => key,
            Ok(None) => {
                tracing::debug!(%instance, "timeline callback without user data");
                return CallbackStatus::Ok;
            }
            Err(err) => {
                tracing::error!(%instance, error = %err, "timeline callback error");
                return CallbackStatus::Ok;
            }
        };

        let applied = match kind {
            CallbackKind::Beat {
                beat,
                bar,
                tempo,
                position,
            } => self.on_beat(key, *beat, *bar, *tempo, *position),
            CallbackKind::Marker { name, position } => self.on_marker(key, name, *position),
        };
        match applied {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%instance, ?key, "timeline callback for revoked record"),
            Err(err) => tracing::error!(%instance, error = %err, "timeline callback error"),
        }
        CallbackStatus::Ok
    }

    /// Records a beat boundary on the timeline behind `key` and notifies beat
    /// subscribers. Returns `false` when the key has been revoked.
    ///
    /// Subscribers run while the key is still registered, so a concurrent
    /// shutdown waits for them.
    pub fn on_beat(
        &self,
        key: TimelineKey,
        beat: i32,
        bar: i32,
        tempo: f32,
        position: i32,
    ) -> Result<bool> {
        let published = self.registry.with(key, |timeline| -> Result<()> {
            timeline.record_beat(beat, bar, tempo)?;
            tracing::trace!(beat, bar, tempo, position, "beat");
            self.events.publish(TimelineEvent::Beat(BeatEvent {
                beat,
                bar,
                tempo,
                position,
            }))
        })?;

        match published {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    /// Records the last marker passed on the timeline behind `key` and
    /// notifies marker subscribers with the decoded marker parameters.
    /// Returns `false` when the key has been revoked.
    pub fn on_marker(&self, key: TimelineKey, name: &str, position: i32) -> Result<bool> {
        let published = self.registry.with(key, |timeline| -> Result<()> {
            timeline.record_marker(name)?;

            let parameters = match decode(name) {
                Ok(parameters) => Some(parameters),
                Err(err) => {
                    tracing::warn!(marker = name, error = %err, "marker parameters could not be decoded");
                    None
                }
            };
            tracing::debug!(marker = name, position, "marker");
            self.events.publish(TimelineEvent::Marker(MarkerEvent {
                name: name.to_string(),
                position,
                parameters,
            }))
        })?;

        match published {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }
}

struct Session {
    instance: InstanceHandle,
    key: TimelineKey,
    timeline: Arc<SharedTimeline>,
}

/// Owns one playback instance of a music event and the timeline record the
/// engine's callbacks write into.
pub struct TimelineBridge {
    backend: Arc<dyn AudioBackend>,
    registry: Arc<TimelineRegistry>,
    events: TimelineEvents,
    diagnostics: Option<Box<dyn DiagnosticsSink>>,
    state: BridgeState,
    session: Option<Session>,
}

impl TimelineBridge {
    /// Creates a bridge with its own timeline registry.
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_registry(backend, Arc::new(TimelineRegistry::new()))
    }

    /// Creates a bridge that allocates its record from a shared registry.
    pub fn with_registry(backend: Arc<dyn AudioBackend>, registry: Arc<TimelineRegistry>) -> Self {
        Self {
            backend,
            registry,
            events: TimelineEvents::new(),
            diagnostics: None,
            state: BridgeState::Uninitialized,
            session: None,
        }
    }

    /// Installs a sink that receives the timeline snapshot on every tick.
    pub fn with_diagnostics(mut self, sink: impl DiagnosticsSink + 'static) -> Self {
        self.diagnostics = Some(Box::new(sink));
        self
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Publish point for beat and marker notifications.
    pub fn events(&self) -> &TimelineEvents {
        &self.events
    }

    /// Playback instance, while initialized or playing.
    pub fn instance(&self) -> Option<InstanceHandle> {
        self.session.as_ref().map(|session| session.instance)
    }

    /// Key the engine holds as user data, while initialized or playing.
    pub fn key(&self) -> Option<TimelineKey> {
        self.session.as_ref().map(|session| session.key)
    }

    /// Owning handle to the live record, for cheap field reads.
    pub fn shared_timeline(&self) -> Option<Arc<SharedTimeline>> {
        self.session.as_ref().map(|session| session.timeline.clone())
    }

    /// Snapshot of the live record, `None` before initialize and after
    /// shutdown.
    pub fn timeline(&self) -> Result<Option<TimelineInfo>> {
        self.session
            .as_ref()
            .map(|session| session.timeline.snapshot())
            .transpose()
    }

    /// Callback receiver bound to this bridge's registry and subscribers.
    pub fn handler(&self) -> TimelineCallbackHandler {
        TimelineCallbackHandler {
            registry: self.registry.clone(),
            events: self.events.clone(),
        }
    }

    /// Resolves `event_name`, creates its playback instance and wires the
    /// timeline record to the engine's beat and marker callbacks.
    pub fn initialize(&mut self, event_name: &str) -> Result<()> {
        if self.state != BridgeState::Uninitialized {
            return Err(SyncError::InvalidState {
                operation: "initialize",
                state: self.state.as_str(),
            });
        }

        let event = self.backend.resolve_event(event_name).map_err(|err| match err {
            EngineError::EventNotFound(_) => SyncError::EventResolution {
                event: event_name.to_string(),
            },
            other => SyncError::Engine(other),
        })?;
        let instance = self.backend.create_instance(event)?;

        let (key, timeline) = match self.registry.insert() {
            Ok(entry) => entry,
            Err(err) => {
                self.release_instance(instance);
                return Err(err);
            }
        };

        let handler = self.handler();
        let callback: InstanceCallback = Arc::new(
            move |backend: &dyn AudioBackend, instance: InstanceHandle, kind: &CallbackKind| {
                handler.handle(backend, instance, kind)
            },
        );
        let wired = self
            .backend
            .set_user_data(instance, Some(key))
            .and_then(|_| {
                self.backend
                    .set_callback(instance, callback, CallbackMask::BEAT | CallbackMask::MARKER)
            })
            .and_then(|_| self.backend.event_length(event));

        match wired {
            Ok(length) => timeline.set_length(length),
            Err(err) => {
                self.detach(instance, key);
                self.release_instance(instance);
                return Err(err.into());
            }
        }

        tracing::info!(event = event_name, %instance, length = timeline.length(), "timeline initialized");
        self.session = Some(Session {
            instance,
            key,
            timeline,
        });
        self.state = BridgeState::Initialized;
        Ok(())
    }

    /// Starts playback. Engine failures are logged, not returned.
    pub fn begin(&mut self) {
        let Some(session) = self.session.as_ref().filter(|_| self.state == BridgeState::Initialized)
        else {
            tracing::debug!(state = %self.state, "ignoring begin");
            return;
        };

        if let Err(err) = self.backend.start(session.instance) {
            tracing::error!(instance = %session.instance, error = %err, "failed to start playback");
        }
        self.state = BridgeState::Playing;
    }

    /// Polls the playback position into the record. Call once per frame.
    pub fn tick(&mut self) {
        let Some(session) = self.session.as_ref().filter(|_| self.state == BridgeState::Playing)
        else {
            return;
        };

        match self.backend.timeline_position(session.instance) {
            Ok(position) => session.timeline.set_position(position),
            Err(err) => {
                tracing::warn!(instance = %session.instance, error = %err, "failed to read timeline position")
            }
        }

        if let Some(sink) = self.diagnostics.as_mut() {
            match session.timeline.snapshot() {
                Ok(info) => sink.present(&info),
                Err(err) => tracing::warn!(error = %err, "timeline snapshot unavailable"),
            }
        }
    }

    /// Revokes the engine's reference to the record, stops playback
    /// immediately and releases the instance. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.state == BridgeState::Stopped {
            return;
        }
        self.state = BridgeState::Stopped;

        let Some(session) = self.session.take() else {
            return;
        };
        self.detach(session.instance, session.key);
        if let Err(err) = self.backend.stop(session.instance, StopMode::Immediate) {
            tracing::warn!(instance = %session.instance, error = %err, "failed to stop playback");
        }
        self.release_instance(session.instance);
        tracing::info!(instance = %session.instance, "timeline shut down");
    }

    fn detach(&self, instance: InstanceHandle, key: TimelineKey) {
        if let Err(err) = self.backend.set_user_data(instance, None) {
            tracing::warn!(%instance, error = %err, "failed to clear instance user data");
        }
        if let Err(err) = self.registry.revoke(key) {
            tracing::warn!(?key, error = %err, "failed to revoke timeline record");
        }
    }

    fn release_instance(&self, instance: InstanceHandle) {
        if let Err(err) = self.backend.release(instance) {
            tracing::warn!(%instance, error = %err, "failed to release instance");
        }
    }
}

impl Drop for TimelineBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimelineBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineBridge")
            .field("state", &self.state)
            .field("instance", &self.instance())
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::audio::simulated::{EngineCall, EventDescriptor, SimulatedEngine};
    use crate::diagnostics::RecordingSink;

    fn engine() -> Arc<SimulatedEngine> {
        Arc::new(SimulatedEngine::new(vec![EventDescriptor::new("theme", 4_000)
            .with_tempo(120.0, 4)
            .with_marker(1_250, "verse{lane=2}")])
        .unwrap())
    }

    fn beat(beat: i32, bar: i32, tempo: f32) -> CallbackKind {
        CallbackKind::Beat {
            beat,
            bar,
            tempo,
            position: 0,
        }
    }

    fn playing(engine: &Arc<SimulatedEngine>) -> TimelineBridge {
        let mut bridge = TimelineBridge::new(engine.clone());
        bridge.initialize("theme").unwrap();
        bridge.begin();
        bridge
    }

    fn info(bridge: &TimelineBridge) -> TimelineInfo {
        bridge.timeline().unwrap().unwrap()
    }

    #[test]
    fn unknown_event_aborts_initialize() {
        let engine = engine();
        let mut bridge = TimelineBridge::new(engine.clone());

        let err = bridge.initialize("missing").unwrap_err();
        assert!(matches!(err, SyncError::EventResolution { ref event } if event == "missing"));
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        assert_eq!(engine.live_instances().unwrap(), 0);
    }

    #[test]
    fn initialize_wires_record_and_callback() {
        let engine = engine();
        let mut bridge = TimelineBridge::new(engine.clone());
        bridge.initialize("theme").unwrap();

        let instance = bridge.instance().unwrap();
        let key = bridge.key().unwrap();
        assert_eq!(bridge.state(), BridgeState::Initialized);
        assert_eq!(info(&bridge).length, 4_000);
        assert_eq!(
            engine.calls().unwrap(),
            vec![
                EngineCall::CreateInstance(instance),
                EngineCall::SetUserData(instance, Some(key)),
                EngineCall::SetCallback(instance, CallbackMask::BEAT | CallbackMask::MARKER),
            ]
        );
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let engine = engine();
        let mut bridge = playing(&engine);

        let err = bridge.initialize("theme").unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { operation: "initialize", .. }));
        assert_eq!(engine.live_instances().unwrap(), 1);
    }

    #[test]
    fn playback_updates_position_beats_and_markers() {
        let engine = engine();
        let mut bridge = playing(&engine);
        assert_eq!(bridge.state(), BridgeState::Playing);

        engine.advance(1_300).unwrap();
        bridge.tick();

        let info = info(&bridge);
        assert_eq!(info.length, 4_000);
        assert_eq!(info.position, 1_300);
        assert_eq!((info.beat, info.bar), (3, 1));
        assert_eq!(info.tempo, 120.0);
        assert_eq!(info.last_marker, "verse{lane=2}");
    }

    #[test]
    fn each_writer_touches_only_its_fields() {
        let engine = engine();
        let mut bridge = playing(&engine);
        let instance = bridge.instance().unwrap();
        let before = info(&bridge);

        engine
            .trigger(instance, beat(3, 9, 95.0))
            .unwrap();
        let after_beat = info(&bridge);
        assert_eq!(
            after_beat,
            TimelineInfo {
                beat: 3,
                bar: 9,
                tempo: 95.0,
                ..before.clone()
            }
        );

        engine
            .trigger(instance, CallbackKind::Marker { name: "bridge".into(), position: 0 })
            .unwrap();
        let after_marker = info(&bridge);
        assert_eq!(
            after_marker,
            TimelineInfo {
                last_marker: "bridge".into(),
                ..after_beat.clone()
            }
        );

        engine.advance(100).unwrap();
        let after_advance = info(&bridge);
        bridge.tick();
        let after_tick = info(&bridge);
        assert_eq!(
            after_tick,
            TimelineInfo {
                position: 100,
                ..after_advance
            }
        );
        assert_eq!(after_tick.length, before.length);
    }

    #[test]
    fn fields_stay_isolated_under_concurrent_callbacks() {
        let engine = engine();
        let mut bridge = playing(&engine);
        let instance = bridge.instance().unwrap();

        let running = Arc::new(AtomicUsize::new(2));
        let clock = {
            let engine = engine.clone();
            let running = running.clone();
            thread::spawn(move || {
                for _ in 0..40 {
                    engine.advance(100).unwrap();
                    thread::yield_now();
                }
                running.fetch_sub(1, Ordering::SeqCst);
            })
        };
        let callbacks = {
            let engine = engine.clone();
            let running = running.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    engine.trigger(instance, beat(2, 5, 140.0)).unwrap();
                    engine
                        .trigger(instance, CallbackKind::Marker { name: "loop".into(), position: 0 })
                        .unwrap();
                }
                running.fetch_sub(1, Ordering::SeqCst);
            })
        };

        let mut last_position = 0;
        while running.load(Ordering::SeqCst) > 0 {
            bridge.tick();
            let info = info(&bridge);
            assert_eq!(info.length, 4_000);
            assert!(info.position >= last_position, "position went backwards");
            assert!((0..=4_000).contains(&info.position));
            last_position = info.position;
            if info.tempo == 140.0 {
                assert_eq!((info.beat, info.bar), (2, 5));
            } else {
                assert!(info.tempo == 120.0 || info.tempo == 0.0);
                assert!((1..=4).contains(&info.beat) || info.beat == 0);
            }
            assert!(matches!(info.last_marker.as_str(), "" | "loop" | "verse{lane=2}"));
        }
        clock.join().unwrap();
        callbacks.join().unwrap();

        bridge.tick();
        let info = info(&bridge);
        assert_eq!(info.length, 4_000);
        assert_eq!(info.position, engine.timeline_position(instance).unwrap());
        assert_eq!(info.position, 4_000);
    }

    #[test]
    fn shutdown_clears_user_data_then_stops_and_releases() {
        let engine = engine();
        let mut bridge = playing(&engine);
        let instance = bridge.instance().unwrap();

        bridge.shutdown();

        let calls = engine.calls().unwrap();
        assert_eq!(
            calls[calls.len() - 3..],
            [
                EngineCall::SetUserData(instance, None),
                EngineCall::Stop(instance, StopMode::Immediate),
                EngineCall::Release(instance),
            ]
        );
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert!(bridge.timeline().unwrap().is_none());
        assert_eq!(engine.live_instances().unwrap(), 0);

        bridge.shutdown();
        assert_eq!(engine.calls().unwrap().len(), calls.len());
    }

    #[test]
    fn no_writes_land_after_shutdown() {
        let engine = engine();
        let mut bridge = playing(&engine);
        let instance = bridge.instance().unwrap();
        let key = bridge.key().unwrap();
        let handler = bridge.handler();
        let timeline = bridge.shared_timeline().unwrap();
        engine.advance(600).unwrap();
        bridge.tick();
        let before = timeline.snapshot().unwrap();

        bridge.shutdown();

        assert!(!handler.on_beat(key, 99, 99, 1.0, 0).unwrap());
        assert!(!handler.on_marker(key, "sentinel", 0).unwrap());
        assert_eq!(
            engine.trigger(instance, beat(99, 99, 1.0)),
            Err(EngineError::InvalidHandle)
        );
        bridge.tick();
        assert_eq!(timeline.snapshot().unwrap(), before);
    }

    #[test]
    fn shutdown_waits_for_in_flight_listeners() {
        let engine = engine();
        let mut bridge = playing(&engine);
        let instance = bridge.instance().unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel();
        {
            let finished = finished.clone();
            let entered_tx = Mutex::new(entered_tx);
            bridge
                .events()
                .on_beat(move |_| {
                    let _ = entered_tx.lock().unwrap().send(());
                    thread::sleep(Duration::from_millis(100));
                    finished.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }

        let callback = {
            let engine = engine.clone();
            thread::spawn(move || engine.trigger(instance, beat(1, 1, 120.0)).unwrap())
        };
        entered_rx.recv().unwrap();
        bridge.shutdown();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(callback.join().unwrap(), Some(CallbackStatus::Ok));
    }

    #[test]
    fn callback_survives_user_data_failure() {
        let engine = engine();
        let bridge = playing(&engine);
        let instance = bridge.instance().unwrap();

        engine.fail_user_data(true).unwrap();
        let status = engine
            .trigger(instance, beat(4, 2, 120.0))
            .unwrap();

        assert_eq!(status, Some(CallbackStatus::Ok));
        assert_eq!((info(&bridge).beat, info(&bridge).bar), (0, 0));
    }

    #[test]
    fn markers_are_published_with_decoded_parameters() {
        let engine = engine();
        let bridge = playing(&engine);
        let instance = bridge.instance().unwrap();
        let rx = bridge.events().subscribe().unwrap();

        engine.advance(1_250).unwrap();
        engine
            .trigger(instance, CallbackKind::Marker { name: "{a=1}{a=2}".into(), position: 1_250 })
            .unwrap();

        let markers: Vec<MarkerEvent> = rx
            .try_iter()
            .filter_map(|event| match event {
                TimelineEvent::Marker(marker) => Some(marker),
                TimelineEvent::Beat(_) => None,
            })
            .collect();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].name, "verse{lane=2}");
        assert_eq!(markers[0].position, 1_250);
        let parameters = markers[0].parameters.as_ref().unwrap();
        assert_eq!(parameters.parse::<u32>("lane"), Some(2));
        assert!(markers[1].parameters.is_none());
        assert_eq!(info(&bridge).last_marker, "{a=1}{a=2}");
    }

    #[test]
    fn beat_listeners_run_on_the_callback_thread() {
        let engine = engine();
        let bridge = playing(&engine);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bridge
            .events()
            .on_beat(move |beat| {
                sink.lock()
                    .unwrap()
                    .push((thread::current().id(), beat.bar, beat.beat, beat.position))
            })
            .unwrap();

        let driver = {
            let engine = engine.clone();
            thread::spawn(move || (thread::current().id(), engine.advance(2_000).unwrap()))
        };
        let (driver_id, delivered) = driver.join().unwrap();
        assert_eq!(delivered, 6);
        assert_ne!(driver_id, thread::current().id());

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(id, ..)| *id == driver_id));
        let beats: Vec<_> = seen
            .iter()
            .map(|(_, bar, beat, position)| (*bar, *beat, *position))
            .collect();
        assert_eq!(
            beats,
            vec![(1, 1, 0), (1, 2, 500), (1, 3, 1_000), (1, 4, 1_500), (2, 1, 2_000)]
        );
    }

    #[test]
    fn dropping_an_active_bridge_releases_the_instance() {
        let engine = engine();
        {
            let _bridge = playing(&engine);
            assert_eq!(engine.live_instances().unwrap(), 1);
        }
        assert_eq!(engine.live_instances().unwrap(), 0);
    }

    #[test]
    fn shared_registry_holds_one_record_per_bridge() {
        let engine = engine();
        let registry = Arc::new(TimelineRegistry::new());
        let mut first = TimelineBridge::with_registry(engine.clone(), registry.clone());
        let mut second = TimelineBridge::with_registry(engine.clone(), registry.clone());
        first.initialize("theme").unwrap();
        second.initialize("theme").unwrap();
        assert_eq!(registry.len().unwrap(), 2);

        first.shutdown();
        assert_eq!(registry.len().unwrap(), 1);
        assert!(registry.contains(second.key().unwrap()).unwrap());
    }

    #[test]
    fn diagnostics_sink_sees_every_tick() {
        let engine = engine();
        let sink = RecordingSink::new();
        let mut bridge = TimelineBridge::new(engine.clone()).with_diagnostics(sink.clone());
        bridge.initialize("theme").unwrap();

        bridge.tick();
        assert!(sink.last().is_none());

        bridge.begin();
        engine.advance(250).unwrap();
        bridge.tick();
        assert!(sink.last().unwrap().contains("Playback Position (ms): 250"));
    }
}
