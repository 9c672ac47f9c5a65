//! Time-based extrapolation of a value from a start value and speeds.
//!
//! Times are milliseconds, speeds are units per second. Every evaluation is a
//! pure function of the stored parameters and the query time, so a client and
//! a server that share the parameters produce bit-identical results.

use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2};
use std::ops::{Add, Mul, Sub};

use bitflags::bitflags;

const MS_TO_SECONDS: f32 = 0.001;

/// Values that can be extrapolated: anything with vector-space arithmetic over `f32`.
pub trait Extrapolatable:
    Copy + Default + PartialEq + Add<Output = Self> + Sub<Output = Self> + Mul<f32, Output = Self>
{
}

impl<T> Extrapolatable for T where
    T: Copy + Default + PartialEq + Add<Output = T> + Sub<Output = T> + Mul<f32, Output = T>
{
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtrapolationKind {
    /// Covered distance = duration * 0.001 * base_speed.
    #[default]
    None,
    /// Covered distance = duration * 0.001 * (base_speed + speed).
    Linear,
    /// Covered distance = duration * 0.001 * (base_speed + 0.5 * speed).
    AccelLinear,
    /// Covered distance = duration * 0.001 * (base_speed + 0.5 * speed).
    DecelLinear,
    /// Covered distance = duration * 0.001 * (base_speed + sqrt(0.5) * speed).
    AccelSine,
    /// Covered distance = duration * 0.001 * (base_speed + sqrt(0.5) * speed).
    DecelSine,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtrapolationFlags: u8 {
        /// Keep extrapolating past `start_time + duration`.
        const NO_STOP = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extrapolation {
    pub kind: ExtrapolationKind,
    pub flags: ExtrapolationFlags,
}

impl Extrapolation {
    pub const NONE: Self = Self::new(ExtrapolationKind::None);
    pub const LINEAR: Self = Self::new(ExtrapolationKind::Linear);
    pub const ACCEL_LINEAR: Self = Self::new(ExtrapolationKind::AccelLinear);
    pub const DECEL_LINEAR: Self = Self::new(ExtrapolationKind::DecelLinear);
    pub const ACCEL_SINE: Self = Self::new(ExtrapolationKind::AccelSine);
    pub const DECEL_SINE: Self = Self::new(ExtrapolationKind::DecelSine);

    pub const fn new(kind: ExtrapolationKind) -> Self {
        Self {
            kind,
            flags: ExtrapolationFlags::empty(),
        }
    }

    pub const fn no_stop(self) -> Self {
        Self {
            kind: self.kind,
            flags: self.flags.union(ExtrapolationFlags::NO_STOP),
        }
    }

    #[inline]
    pub fn stops(&self) -> bool {
        !self.flags.contains(ExtrapolationFlags::NO_STOP)
    }
}

impl From<ExtrapolationKind> for Extrapolation {
    fn from(kind: ExtrapolationKind) -> Self {
        Self::new(kind)
    }
}

/// Predicts a value of type `T` at any time from a parametric speed model.
///
/// The last evaluation is cached: asking for the same time again returns the
/// stored value without recomputing it.
#[derive(Debug, Clone)]
pub struct Extrapolator<T> {
    extrapolation: Extrapolation,
    start_time: f32,
    duration: f32,
    start_value: T,
    base_speed: T,
    speed: T,
    cache: Option<(f32, T)>,
}

impl<T: Extrapolatable> Default for Extrapolator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Extrapolatable> Extrapolator<T> {
    pub fn new() -> Self {
        Self {
            extrapolation: Extrapolation::NONE,
            start_time: 0.0,
            duration: 0.0,
            start_value: T::default(),
            base_speed: T::default(),
            speed: T::default(),
            cache: None,
        }
    }

    pub fn init(
        &mut self,
        start_time: f32,
        duration: f32,
        start_value: T,
        base_speed: T,
        speed: T,
        extrapolation: impl Into<Extrapolation>,
    ) {
        self.extrapolation = extrapolation.into();
        self.start_time = start_time;
        self.duration = duration.max(0.0);
        self.start_value = start_value;
        self.base_speed = base_speed;
        self.speed = speed;
        self.cache = None;
    }

    pub fn with(
        start_time: f32,
        duration: f32,
        start_value: T,
        base_speed: T,
        speed: T,
        extrapolation: impl Into<Extrapolation>,
    ) -> Self {
        let mut extrapolator = Self::new();
        extrapolator.init(start_time, duration, start_value, base_speed, speed, extrapolation);
        extrapolator
    }

    /// Value at `time`, served from the cache when `time` was the last query.
    pub fn evaluate(&mut self, time: f32) -> T {
        if let Some((cached_time, cached_value)) = self.cache {
            if cached_time == time {
                return cached_value;
            }
        }
        let value = self.value_at(time);
        self.cache = Some((time, value));
        value
    }

    /// Uncached evaluation; `evaluate` is the same function plus the cache.
    pub fn value_at(&self, time: f32) -> T {
        if time < self.start_time {
            return self.start_value;
        }

        let end_time = self.start_time + self.duration;
        let time = if self.extrapolation.stops() && time > end_time {
            end_time
        } else {
            time
        };
        let elapsed = time - self.start_time;
        let linear = elapsed * MS_TO_SECONDS;

        match self.extrapolation.kind {
            ExtrapolationKind::None => self.start_value + self.base_speed * linear,
            ExtrapolationKind::Linear => self.start_value + (self.base_speed + self.speed) * linear,
            _ if self.duration == 0.0 => self.start_value,
            kind => {
                let fraction = elapsed / self.duration;
                let span = self.duration * MS_TO_SECONDS;
                let s = match kind {
                    ExtrapolationKind::AccelLinear => 0.5 * fraction * fraction * span,
                    ExtrapolationKind::DecelLinear => (fraction - 0.5 * fraction * fraction) * span,
                    ExtrapolationKind::AccelSine => {
                        (1.0 - (fraction * FRAC_PI_2).cos()) * span * FRAC_1_SQRT_2
                    }
                    _ => (fraction * FRAC_PI_2).sin() * span * FRAC_1_SQRT_2,
                };
                // Base term in seconds, as for None and Linear.
                self.start_value + self.base_speed * linear + self.speed * s
            }
        }
    }

    /// Derivative of the value in units per second.
    pub fn evaluate_speed(&self, time: f32) -> T {
        let zero = T::default();
        if time < self.start_time || self.duration == 0.0 {
            return zero;
        }
        if self.extrapolation.stops() && time > self.start_time + self.duration {
            return zero;
        }

        let fraction = (time - self.start_time) / self.duration;
        let sine_scale = FRAC_PI_2 * FRAC_1_SQRT_2;
        match self.extrapolation.kind {
            ExtrapolationKind::None => self.base_speed,
            ExtrapolationKind::Linear => self.base_speed + self.speed,
            ExtrapolationKind::AccelLinear => self.base_speed + self.speed * fraction,
            ExtrapolationKind::DecelLinear => self.base_speed + self.speed * (1.0 - fraction),
            ExtrapolationKind::AccelSine => {
                self.base_speed + self.speed * ((fraction * FRAC_PI_2).sin() * sine_scale)
            }
            ExtrapolationKind::DecelSine => {
                self.base_speed + self.speed * ((fraction * FRAC_PI_2).cos() * sine_scale)
            }
        }
    }

    pub fn is_done(&self, time: f32) -> bool {
        self.extrapolation.stops() && time >= self.start_time + self.duration
    }

    pub fn start_time(&self) -> f32 {
        self.start_time
    }

    pub fn set_start_time(&mut self, time: f32) {
        self.start_time = time;
        self.cache = None;
    }

    /// Zero when the extrapolation never stops.
    pub fn end_time(&self) -> f32 {
        if self.extrapolation.stops() && self.duration > 0.0 {
            self.start_time + self.duration
        } else {
            0.0
        }
    }

    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn start_value(&self) -> T {
        self.start_value
    }

    pub fn set_start_value(&mut self, value: T) {
        self.start_value = value;
        self.cache = None;
    }

    pub fn base_speed(&self) -> T {
        self.base_speed
    }

    pub fn speed(&self) -> T {
        self.speed
    }

    pub fn extrapolation(&self) -> Extrapolation {
        self.extrapolation
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    const EPSILON: f32 = 1e-4;

    const ALL_KINDS: [ExtrapolationKind; 6] = [
        ExtrapolationKind::None,
        ExtrapolationKind::Linear,
        ExtrapolationKind::AccelLinear,
        ExtrapolationKind::DecelLinear,
        ExtrapolationKind::AccelSine,
        ExtrapolationKind::DecelSine,
    ];

    #[test]
    fn none_policy_holds_after_duration() {
        let mut e = Extrapolator::with(0.0, 1000.0, 0.0f32, 10.0, 0.0, Extrapolation::NONE);
        assert!((e.evaluate(500.0) - 5.0).abs() < EPSILON);
        assert!((e.evaluate(1500.0) - 10.0).abs() < EPSILON);
    }

    #[test]
    fn none_policy_ignores_speed() {
        let e = Extrapolator::with(0.0, 1000.0, 1.0f32, 2.0, 50.0, Extrapolation::NONE);
        assert!((e.value_at(1000.0) - 3.0).abs() < EPSILON);
    }

    #[test]
    fn no_stop_keeps_going() {
        let mut e = Extrapolator::with(
            0.0,
            1000.0,
            0.0f32,
            10.0,
            0.0,
            Extrapolation::NONE.no_stop(),
        );
        assert!((e.evaluate(1500.0) - 15.0).abs() < EPSILON);
        assert!(!e.is_done(5000.0));
        assert_eq!(e.end_time(), 0.0);
    }

    #[test]
    fn linear_adds_both_speeds() {
        let e = Extrapolator::with(100.0, 1000.0, 0.0f32, 1.0, 3.0, Extrapolation::LINEAR);
        assert!((e.value_at(600.0) - 2.0).abs() < EPSILON);
        assert!((e.value_at(1100.0) - 4.0).abs() < EPSILON);
    }

    #[test]
    fn before_start_returns_start_value() {
        for kind in ALL_KINDS {
            let e = Extrapolator::with(500.0, 1000.0, 7.0f32, 2.0, 3.0, kind);
            assert_eq!(e.value_at(100.0), 7.0);
            assert_eq!(e.evaluate_speed(100.0), 0.0);
        }
    }

    #[test]
    fn ease_laws_reach_their_documented_displacement() {
        let (start, base, speed, duration) = (2.0f32, 4.0f32, 6.0f32, 800.0f32);
        let span = duration * 0.001;
        let expected = [
            (ExtrapolationKind::AccelLinear, start + span * (base + 0.5 * speed)),
            (ExtrapolationKind::DecelLinear, start + span * (base + 0.5 * speed)),
            (ExtrapolationKind::AccelSine, start + span * (base + FRAC_1_SQRT_2 * speed)),
            (ExtrapolationKind::DecelSine, start + span * (base + FRAC_1_SQRT_2 * speed)),
        ];
        for (kind, value) in expected {
            let e = Extrapolator::with(0.0, duration, start, base, speed, kind);
            assert!(
                (e.value_at(duration) - value).abs() < EPSILON,
                "{kind:?} ended at {} instead of {value}",
                e.value_at(duration)
            );
        }
    }

    #[test]
    fn accel_and_decel_agree_on_total_displacement() {
        let pairs = [
            (ExtrapolationKind::AccelLinear, ExtrapolationKind::DecelLinear),
            (ExtrapolationKind::AccelSine, ExtrapolationKind::DecelSine),
        ];
        for (accel, decel) in pairs {
            let a = Extrapolator::with(0.0, 1000.0, 0.0f32, 1.0, 10.0, accel);
            let d = Extrapolator::with(0.0, 1000.0, 0.0f32, 1.0, 10.0, decel);
            assert!((a.value_at(1000.0) - d.value_at(1000.0)).abs() < EPSILON);
        }
    }

    #[test]
    fn every_policy_is_continuous_over_its_duration() {
        let duration = 1000.0f32;
        for kind in ALL_KINDS {
            let e = Extrapolator::with(0.0, duration, 0.0f32, 5.0, 20.0, kind);
            let mut previous = e.value_at(0.0);
            for step in 1..=1000 {
                let value = e.value_at(step as f32);
                assert!(
                    (value - previous).abs() < 0.05,
                    "{kind:?} jumps at t={step}"
                );
                previous = value;
            }
        }
    }

    #[test]
    fn zero_duration_holds_ease_families_at_start() {
        let kinds = [
            ExtrapolationKind::AccelLinear,
            ExtrapolationKind::DecelLinear,
            ExtrapolationKind::AccelSine,
            ExtrapolationKind::DecelSine,
        ];
        for kind in kinds {
            let mut e = Extrapolator::with(10.0, 0.0, 3.0f32, 1.0, 1.0, kind);
            assert_eq!(e.evaluate(10.0), 3.0);
            assert_eq!(e.evaluate(5000.0), 3.0);
            let no_stop = Extrapolation::new(kind).no_stop();
            let e = Extrapolator::with(10.0, 0.0, 3.0f32, 1.0, 1.0, no_stop);
            assert_eq!(e.value_at(5000.0), 3.0);
            assert!(!e.evaluate_speed(20.0).is_nan());
        }
    }

    #[test]
    fn repeated_evaluation_is_bit_identical() {
        for kind in ALL_KINDS {
            let mut e = Extrapolator::with(0.0, 1234.0, 0.3f32, 1.7, 2.9, kind);
            let first = e.evaluate(617.3);
            let second = e.evaluate(617.3);
            assert_eq!(first.to_bits(), second.to_bits());
        }
    }

    #[test]
    fn setters_invalidate_the_cache() {
        let mut e = Extrapolator::with(0.0, 1000.0, 0.0f32, 10.0, 0.0, Extrapolation::NONE);
        assert!((e.evaluate(500.0) - 5.0).abs() < EPSILON);

        e.set_start_value(100.0);
        assert!((e.evaluate(500.0) - 105.0).abs() < EPSILON);

        e.set_start_time(500.0);
        assert!((e.evaluate(500.0) - 100.0).abs() < EPSILON);
    }

    #[test]
    fn speed_follows_the_ease_law() {
        let accel = Extrapolator::with(0.0, 1000.0, 0.0f32, 1.0, 4.0, Extrapolation::ACCEL_LINEAR);
        assert!((accel.evaluate_speed(0.0) - 1.0).abs() < EPSILON);
        assert!((accel.evaluate_speed(500.0) - 3.0).abs() < EPSILON);
        assert!((accel.evaluate_speed(1000.0) - 5.0).abs() < EPSILON);
        assert_eq!(accel.evaluate_speed(1001.0), 0.0);

        let decel = Extrapolator::with(0.0, 1000.0, 0.0f32, 1.0, 4.0, Extrapolation::DECEL_LINEAR);
        assert!((decel.evaluate_speed(0.0) - 5.0).abs() < EPSILON);
        assert!((decel.evaluate_speed(1000.0) - 1.0).abs() < EPSILON);
    }

    #[test]
    fn sine_speed_matches_numeric_derivative() {
        for kind in [ExtrapolationKind::AccelSine, ExtrapolationKind::DecelSine] {
            let e = Extrapolator::with(0.0, 1000.0, 0.0f32, 0.0, 10.0, kind);
            let h = 0.5;
            let numeric = (e.value_at(400.0 + h) - e.value_at(400.0 - h)) / (2.0 * h) * 1000.0;
            assert!((numeric - e.evaluate_speed(400.0)).abs() < 1e-2, "{kind:?}");
        }
    }

    #[test]
    fn is_done_respects_no_stop() {
        let e = Extrapolator::with(100.0, 200.0, 0.0f32, 1.0, 0.0, Extrapolation::LINEAR);
        assert!(!e.is_done(299.0));
        assert!(e.is_done(300.0));
        assert_eq!(e.end_time(), 300.0);
    }

    #[test]
    fn extrapolates_vectors() {
        let mut e = Extrapolator::with(
            0.0,
            1000.0,
            Vec3::ZERO,
            Vec3::new(1.0, 0.0, -2.0),
            Vec3::ZERO,
            Extrapolation::LINEAR,
        );
        let value = e.evaluate(500.0);
        assert!((value - Vec3::new(0.5, 0.0, -1.0)).length() < EPSILON);
    }
}
