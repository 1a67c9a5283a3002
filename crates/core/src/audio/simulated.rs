//! Deterministic in-process audio engine.
//!
//! Events are authored up front with a length, tempo, time signature and
//! markers. Nothing plays until [`SimulatedEngine::advance`] moves the clock;
//! every beat boundary and marker crossed on the way is delivered to the
//! instance callback on the thread calling `advance`, which stands in for the
//! middleware's own scheduling thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::{
    AudioBackend, CallbackKind, CallbackMask, CallbackStatus, EngineError, EngineResult,
    EventHandle, InstanceCallback, InstanceHandle, StopMode,
};
use crate::timeline::TimelineKey;

/// Shortest beat period the engine will schedule, in milliseconds.
const MIN_BEAT_PERIOD_MS: f64 = 1.0;

fn default_tempo() -> f32 {
    120.0
}

fn default_beats_per_bar() -> i32 {
    4
}

/// Authored music event known to the simulated engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub name: String,
    pub length_ms: i32,
    #[serde(default = "default_tempo")]
    pub tempo: f32,
    #[serde(default = "default_beats_per_bar")]
    pub beats_per_bar: i32,
    #[serde(default)]
    pub markers: Vec<MarkerDescriptor>,
}

impl EventDescriptor {
    /// Event in 4/4 at 120 BPM with no markers.
    pub fn new(name: impl Into<String>, length_ms: i32) -> Self {
        Self {
            name: name.into(),
            length_ms,
            tempo: default_tempo(),
            beats_per_bar: default_beats_per_bar(),
            markers: Vec::new(),
        }
    }

    /// Sets the tempo in BPM and the time signature numerator.
    pub fn with_tempo(mut self, tempo: f32, beats_per_bar: i32) -> Self {
        self.tempo = tempo;
        self.beats_per_bar = beats_per_bar;
        self
    }

    /// Adds a marker at `position_ms`.
    pub fn with_marker(mut self, position_ms: i32, name: impl Into<String>) -> Self {
        self.markers.push(MarkerDescriptor {
            position_ms,
            name: name.into(),
        });
        self
    }

    /// Checks that the event can be scheduled: a non-negative length, a
    /// finite tempo with beats at least a millisecond apart and at least one
    /// beat per bar.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: &str| EngineError::InvalidEvent {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.length_ms < 0 {
            return Err(invalid("length must not be negative"));
        }
        if !self.tempo.is_finite() || self.tempo <= 0.0 {
            return Err(invalid("tempo must be a positive finite number"));
        }
        if self.beat_period() < MIN_BEAT_PERIOD_MS {
            return Err(invalid("tempo is too fast, beats must be at least 1 ms apart"));
        }
        if self.beats_per_bar < 1 {
            return Err(invalid("beats per bar must be at least 1"));
        }
        Ok(())
    }

    fn beat_period(&self) -> f64 {
        60_000.0 / f64::from(self.tempo)
    }

    fn beat_time(&self, index: i64) -> Option<i32> {
        let ms = (index as f64 * self.beat_period()).round();
        (ms < f64::from(self.length_ms)).then_some(ms as i32)
    }

    fn beat_kind(&self, index: i64, position: i32) -> CallbackKind {
        let per_bar = i64::from(self.beats_per_bar);
        CallbackKind::Beat {
            beat: (index % per_bar + 1) as i32,
            bar: (index / per_bar + 1) as i32,
            tempo: self.tempo,
            position,
        }
    }
}

/// Named point on an event's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerDescriptor {
    pub position_ms: i32,
    pub name: String,
}

/// Every state-changing call the engine received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateInstance(InstanceHandle),
    SetUserData(InstanceHandle, Option<TimelineKey>),
    SetCallback(InstanceHandle, CallbackMask),
    Start(InstanceHandle),
    Stop(InstanceHandle, StopMode),
    Release(InstanceHandle),
}

struct Instance {
    event: usize,
    position: i32,
    playing: bool,
    next_beat: i64,
    next_marker: usize,
    user_data: Option<TimelineKey>,
    callback: Option<(InstanceCallback, CallbackMask)>,
}

#[derive(Default)]
struct EngineState {
    instances: HashMap<u64, Instance>,
    next_instance: u64,
    calls: Vec<EngineCall>,
    fail_user_data: bool,
}

type Pending = (InstanceCallback, InstanceHandle, CallbackKind);

/// In-process [`AudioBackend`] driven by an explicit clock.
pub struct SimulatedEngine {
    events: Vec<EventDescriptor>,
    state: Mutex<EngineState>,
}

impl SimulatedEngine {
    /// Builds an engine that knows `events`. Fails with
    /// [`EngineError::InvalidEvent`] if any event cannot be scheduled.
    pub fn new(events: Vec<EventDescriptor>) -> EngineResult<Self> {
        let events = events
            .into_iter()
            .map(|mut event| {
                event.validate()?;
                event.markers.sort_by_key(|marker| marker.position_ms);
                Ok(event)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            events,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Makes every subsequent `user_data` lookup fail until switched off.
    pub fn fail_user_data(&self, fail: bool) -> EngineResult<()> {
        self.lock()?.fail_user_data = fail;
        Ok(())
    }

    /// Calls received so far.
    pub fn calls(&self) -> EngineResult<Vec<EngineCall>> {
        Ok(self.lock()?.calls.clone())
    }

    /// Number of instances that have not been released.
    pub fn live_instances(&self) -> EngineResult<usize> {
        Ok(self.lock()?.instances.len())
    }

    /// Whether `instance` is started and has not reached its end.
    pub fn is_playing(&self, instance: InstanceHandle) -> EngineResult<bool> {
        let state = self.lock()?;
        Ok(Self::instance(&state, instance)?.playing)
    }

    /// Moves every playing instance forward by `delta_ms` and delivers the
    /// beats and markers crossed, in timeline order. Playback stops at the
    /// end of the event. Returns the number of callbacks delivered.
    pub fn advance(&self, delta_ms: i32) -> EngineResult<usize> {
        let pending = {
            let mut state = self.lock()?;
            let mut pending = Vec::new();
            for (&id, instance) in state.instances.iter_mut() {
                if instance.playing {
                    self.step(InstanceHandle(id), instance, delta_ms.max(0), &mut pending);
                }
            }
            pending
        };

        let delivered = pending.len();
        for (callback, instance, kind) in pending {
            callback(self as &dyn AudioBackend, instance, &kind);
        }
        Ok(delivered)
    }

    /// Delivers `kind` to the instance callback immediately, bypassing the
    /// clock. Returns `None` when no registered callback accepts it.
    pub fn trigger(
        &self,
        instance: InstanceHandle,
        kind: CallbackKind,
    ) -> EngineResult<Option<CallbackStatus>> {
        let callback = {
            let state = self.lock()?;
            Self::instance(&state, instance)?
                .callback
                .as_ref()
                .filter(|(_, mask)| mask.accepts(&kind))
                .map(|(callback, _)| callback.clone())
        };
        Ok(callback.map(|callback| callback(self as &dyn AudioBackend, instance, &kind)))
    }

    fn step(
        &self,
        handle: InstanceHandle,
        instance: &mut Instance,
        delta_ms: i32,
        pending: &mut Vec<Pending>,
    ) {
        let event = &self.events[instance.event];
        let target = instance.position.saturating_add(delta_ms).min(event.length_ms);

        let mut crossed: Vec<(i32, CallbackKind)> = Vec::new();
        while let Some(at) = event.beat_time(instance.next_beat).filter(|at| *at <= target) {
            crossed.push((at, event.beat_kind(instance.next_beat, at)));
            instance.next_beat += 1;
        }
        while let Some(marker) = event
            .markers
            .get(instance.next_marker)
            .filter(|marker| marker.position_ms <= target)
        {
            crossed.push((
                marker.position_ms,
                CallbackKind::Marker {
                    name: marker.name.clone(),
                    position: marker.position_ms,
                },
            ));
            instance.next_marker += 1;
        }
        crossed.sort_by_key(|(at, _)| *at);

        instance.position = target;
        if target >= event.length_ms {
            instance.playing = false;
        }

        if let Some((callback, mask)) = &instance.callback {
            pending.extend(
                crossed
                    .into_iter()
                    .filter(|(_, kind)| mask.accepts(kind))
                    .map(|(_, kind)| (callback.clone(), handle, kind)),
            );
        }
    }

    fn event(&self, event: EventHandle) -> EngineResult<&EventDescriptor> {
        self.events
            .get(event.0 as usize)
            .ok_or(EngineError::InvalidHandle)
    }

    fn instance(state: &EngineState, handle: InstanceHandle) -> EngineResult<&Instance> {
        state
            .instances
            .get(&handle.0)
            .ok_or(EngineError::InvalidHandle)
    }

    fn instance_mut(state: &mut EngineState, handle: InstanceHandle) -> EngineResult<&mut Instance> {
        state
            .instances
            .get_mut(&handle.0)
            .ok_or(EngineError::InvalidHandle)
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Rejected("engine state has been poisoned".into()))
    }
}

impl AudioBackend for SimulatedEngine {
    fn resolve_event(&self, name: &str) -> EngineResult<EventHandle> {
        self.events
            .iter()
            .position(|event| event.name == name)
            .map(|index| EventHandle(index as u64))
            .ok_or_else(|| EngineError::EventNotFound(name.to_string()))
    }

    fn create_instance(&self, event: EventHandle) -> EngineResult<InstanceHandle> {
        self.event(event)?;
        let mut state = self.lock()?;
        let handle = InstanceHandle(state.next_instance);
        state.next_instance += 1;
        state.instances.insert(
            handle.0,
            Instance {
                event: event.0 as usize,
                position: 0,
                playing: false,
                next_beat: 0,
                next_marker: 0,
                user_data: None,
                callback: None,
            },
        );
        state.calls.push(EngineCall::CreateInstance(handle));
        Ok(handle)
    }

    fn event_length(&self, event: EventHandle) -> EngineResult<i32> {
        Ok(self.event(event)?.length_ms)
    }

    fn set_user_data(&self, instance: InstanceHandle, data: Option<TimelineKey>) -> EngineResult<()> {
        let mut state = self.lock()?;
        Self::instance_mut(&mut state, instance)?.user_data = data;
        state.calls.push(EngineCall::SetUserData(instance, data));
        Ok(())
    }

    fn user_data(&self, instance: InstanceHandle) -> EngineResult<Option<TimelineKey>> {
        let state = self.lock()?;
        if state.fail_user_data {
            return Err(EngineError::Rejected("user data unavailable".into()));
        }
        Ok(Self::instance(&state, instance)?.user_data)
    }

    fn set_callback(
        &self,
        instance: InstanceHandle,
        callback: InstanceCallback,
        mask: CallbackMask,
    ) -> EngineResult<()> {
        let mut state = self.lock()?;
        Self::instance_mut(&mut state, instance)?.callback = Some((callback, mask));
        state.calls.push(EngineCall::SetCallback(instance, mask));
        Ok(())
    }

    fn start(&self, instance: InstanceHandle) -> EngineResult<()> {
        let mut state = self.lock()?;
        Self::instance_mut(&mut state, instance)?.playing = true;
        state.calls.push(EngineCall::Start(instance));
        Ok(())
    }

    fn timeline_position(&self, instance: InstanceHandle) -> EngineResult<i32> {
        let state = self.lock()?;
        Ok(Self::instance(&state, instance)?.position)
    }

    fn stop(&self, instance: InstanceHandle, mode: StopMode) -> EngineResult<()> {
        let mut state = self.lock()?;
        Self::instance_mut(&mut state, instance)?.playing = false;
        state.calls.push(EngineCall::Stop(instance, mode));
        Ok(())
    }

    fn release(&self, instance: InstanceHandle) -> EngineResult<()> {
        let mut state = self.lock()?;
        state
            .instances
            .remove(&instance.0)
            .ok_or(EngineError::InvalidHandle)?;
        state.calls.push(EngineCall::Release(instance));
        Ok(())
    }
}

impl fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedEngine")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
