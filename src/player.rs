use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    config::Config,
    protocol::{SyncEvent, SyncEventKind},
    store::PlaybackState,
};

/// A controllable playback surface on a client.
///
/// The engine never calls this; it is the contract every client adapter
/// implements so corrections are applied identically everywhere. Adapters
/// must only call into the device after receiving an authoritative
/// broadcast, never optimistically on local input.
pub trait PlayerDevice {
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position: f32);
    fn set_rate(&self, rate: f32);
    /// The device's locally observed playback position, in seconds.
    fn position(&self) -> f32;
}

/// Applies an accepted event to a device.
pub fn apply_event(device: &impl PlayerDevice, event: &SyncEvent) {
    match event.kind {
        SyncEventKind::Play => {
            device.seek(event.position);
            device.set_rate(event.rate);
            device.play();
        }
        SyncEventKind::Pause | SyncEventKind::Ended => {
            device.pause();
            device.seek(event.position);
        }
        SyncEventKind::Seek => {
            device.seek(event.position);
        }
        SyncEventKind::RateChange => {
            device.set_rate(event.rate);
        }
    }
}

/// How far the device has drifted from the authoritative extrapolation.
pub fn drift(device: &impl PlayerDevice, playback: &PlaybackState, now: DateTime<Utc>) -> f32 {
    (device.position() - playback.expected_position(now)).abs()
}

/// Reconciles the device against the authoritative snapshot, seeking only
/// when drift exceeds the published threshold. Small drift is left alone;
/// constant micro-seeking looks worse than being half a second off.
pub fn reconcile(device: &impl PlayerDevice, playback: &PlaybackState, now: DateTime<Utc>) {
    let drift = drift(device, playback, now);

    if drift > Config::DRIFT_THRESHOLD {
        let expected = playback.expected_position(now);

        debug!("Local playback drifted {:.2}s, resyncing to {:.2}s", drift, expected);
        device.seek(expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UpdateOrigin;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeDevice {
        position: Mutex<f32>,
        playing: Mutex<bool>,
        rate: Mutex<f32>,
    }

    impl PlayerDevice for FakeDevice {
        fn play(&self) {
            *self.playing.lock() = true;
        }

        fn pause(&self) {
            *self.playing.lock() = false;
        }

        fn seek(&self, position: f32) {
            *self.position.lock() = position;
        }

        fn set_rate(&self, rate: f32) {
            *self.rate.lock() = rate;
        }

        fn position(&self) -> f32 {
            *self.position.lock()
        }
    }

    fn playing_state(position: f32, now: DateTime<Utc>) -> PlaybackState {
        PlaybackState {
            position,
            is_playing: true,
            rate: 1.0,
            version: 1,
            updated_at: now,
            updated_by: UpdateOrigin::System,
        }
    }

    #[test]
    fn test_apply_play_event() {
        let device = FakeDevice::default();

        apply_event(
            &device,
            &SyncEvent {
                kind: SyncEventKind::Play,
                position: 12.0,
                rate: 1.5,
                version: 1,
                origin: UpdateOrigin::System,
                emitted_at: Utc::now(),
            },
        );

        assert_eq!(device.position(), 12.0);
        assert!(*device.playing.lock());
        assert_eq!(*device.rate.lock(), 1.5);
    }

    #[test]
    fn test_reconcile_leaves_small_drift_alone() {
        let now = Utc::now();
        let device = FakeDevice::default();
        device.seek(10.5);

        reconcile(&device, &playing_state(10.0, now), now);

        assert_eq!(device.position(), 10.5);
    }

    #[test]
    fn test_reconcile_resyncs_large_drift() {
        let now = Utc::now();
        let device = FakeDevice::default();
        device.seek(30.0);

        // Authoritative state was captured 3 seconds ago at position 10
        let state = playing_state(10.0, now - chrono::Duration::seconds(3));
        reconcile(&device, &state, now);

        assert!((device.position() - 13.0).abs() < 0.01);
    }
}
