use glam::Vec3;

use crate::extrapolate::{Extrapolation, Extrapolator};

use super::game::RemoteMotion;

/// Smoothed position of one remote entity between snapshots.
///
/// `motion` carries the entity forward from its last authoritative position;
/// `correction` decays the visible error that existed when that position
/// arrived, so retargeting never pops.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    motion: Extrapolator<Vec3>,
    correction: Extrapolator<Vec3>,
    last_seen: u32,
}

impl RemoteTrack {
    pub fn new(motion: &RemoteMotion, now_ms: f32, limit_ms: f32, snapshot: u32) -> Self {
        Self {
            motion: Extrapolator::with(
                now_ms,
                limit_ms,
                motion.position,
                motion.velocity,
                Vec3::ZERO,
                Extrapolation::LINEAR,
            ),
            correction: Extrapolator::new(),
            last_seen: snapshot,
        }
    }

    pub fn retarget(
        &mut self,
        motion: &RemoteMotion,
        now_ms: f32,
        limit_ms: f32,
        blend_ms: f32,
        snapshot: u32,
    ) {
        let error = self.value_at(now_ms) - motion.position;
        self.motion.init(
            now_ms,
            limit_ms,
            motion.position,
            motion.velocity,
            Vec3::ZERO,
            Extrapolation::LINEAR,
        );

        if blend_ms > 0.0 && error != Vec3::ZERO {
            // Decel displacement over the full duration is half of speed * duration.
            let speed = error * (-2000.0 / blend_ms);
            self.correction.init(
                now_ms,
                blend_ms,
                error,
                Vec3::ZERO,
                speed,
                Extrapolation::DECEL_LINEAR,
            );
        } else {
            self.correction = Extrapolator::new();
        }
        self.last_seen = snapshot;
    }

    pub fn evaluate(&mut self, now_ms: f32) -> Vec3 {
        self.motion.evaluate(now_ms) + self.correction.evaluate(now_ms)
    }

    pub fn value_at(&self, now_ms: f32) -> Vec3 {
        self.motion.value_at(now_ms) + self.correction.value_at(now_ms)
    }

    pub fn velocity_at(&self, now_ms: f32) -> Vec3 {
        self.motion.evaluate_speed(now_ms) + self.correction.evaluate_speed(now_ms)
    }

    /// Past the extrapolation limit the entity is held in place.
    pub fn is_stale(&self, now_ms: f32) -> bool {
        self.motion.is_done(now_ms)
    }

    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion(x: f32, vx: f32) -> RemoteMotion {
        RemoteMotion {
            entity: 7,
            position: Vec3::new(x, 0.0, 0.0),
            velocity: Vec3::new(vx, 0.0, 0.0),
        }
    }

    #[test]
    fn extrapolates_up_to_the_limit() {
        let mut track = RemoteTrack::new(&motion(0.0, 10.0), 0.0, 250.0, 1);
        assert!((track.evaluate(100.0).x - 1.0).abs() < 1e-5);
        assert!((track.evaluate(250.0).x - 2.5).abs() < 1e-5);
        assert!((track.evaluate(1000.0).x - 2.5).abs() < 1e-5);
        assert!(track.is_stale(1000.0));
    }

    #[test]
    fn retarget_is_continuous_and_converges() {
        let mut track = RemoteTrack::new(&motion(0.0, 10.0), 0.0, 250.0, 1);
        let shown = track.evaluate(100.0);

        track.retarget(&motion(2.0, 10.0), 100.0, 250.0, 100.0, 2);
        assert!((track.evaluate(100.0) - shown).length() < 1e-5);

        let converged = track.evaluate(200.0);
        assert!((converged.x - 3.0).abs() < 1e-4);
        assert_eq!(track.last_seen(), 2);
    }

    #[test]
    fn no_blend_snaps_to_the_new_position() {
        let mut track = RemoteTrack::new(&motion(0.0, 0.0), 0.0, 250.0, 1);
        track.retarget(&motion(5.0, 0.0), 50.0, 250.0, 0.0, 2);
        assert_eq!(track.evaluate(50.0), Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(track.velocity_at(60.0), Vec3::ZERO);
    }
}
