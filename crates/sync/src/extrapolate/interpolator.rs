use std::f32::consts::FRAC_1_SQRT_2;

use super::extrapolator::{Extrapolatable, Extrapolation, ExtrapolationKind, Extrapolator};

const MS_TO_SECONDS: f32 = 0.001;

/// Linear blend from `start_value` to `end_value` over `duration` milliseconds.
#[derive(Debug, Clone)]
pub struct Interpolator<T> {
    start_time: f32,
    duration: f32,
    start_value: T,
    end_value: T,
    cache: Option<(f32, T)>,
}

impl<T: Extrapolatable> Default for Interpolator<T> {
    fn default() -> Self {
        Self::new(0.0, 0.0, T::default(), T::default())
    }
}

impl<T: Extrapolatable> Interpolator<T> {
    pub fn new(start_time: f32, duration: f32, start_value: T, end_value: T) -> Self {
        Self {
            start_time,
            duration: duration.max(0.0),
            start_value,
            end_value,
            cache: None,
        }
    }

    pub fn init(&mut self, start_time: f32, duration: f32, start_value: T, end_value: T) {
        *self = Self::new(start_time, duration, start_value, end_value);
    }

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

    pub fn value_at(&self, time: f32) -> T {
        let elapsed = time - self.start_time;
        if elapsed <= 0.0 {
            self.start_value
        } else if elapsed >= self.duration {
            self.end_value
        } else {
            self.start_value + (self.end_value - self.start_value) * (elapsed / self.duration)
        }
    }

    pub fn is_done(&self, time: f32) -> bool {
        time >= self.end_time()
    }

    pub fn start_time(&self) -> f32 {
        self.start_time
    }

    pub fn set_start_time(&mut self, time: f32) {
        self.start_time = time;
        self.cache = None;
    }

    pub fn end_time(&self) -> f32 {
        self.start_time + self.duration
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

    pub fn end_value(&self) -> T {
        self.end_value
    }

    pub fn set_end_value(&mut self, value: T) {
        self.end_value = value;
        self.cache = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EaseCurve {
    #[default]
    Linear,
    Sine,
}

impl EaseCurve {
    /// Fraction of `duration * speed` an ease phase covers.
    fn displacement_factor(self) -> f32 {
        match self {
            EaseCurve::Linear => 0.5,
            EaseCurve::Sine => FRAC_1_SQRT_2,
        }
    }

    fn accel(self) -> ExtrapolationKind {
        match self {
            EaseCurve::Linear => ExtrapolationKind::AccelLinear,
            EaseCurve::Sine => ExtrapolationKind::AccelSine,
        }
    }

    fn decel(self) -> ExtrapolationKind {
        match self {
            EaseCurve::Linear => ExtrapolationKind::DecelLinear,
            EaseCurve::Sine => ExtrapolationKind::DecelSine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accel,
    Cruise,
    Decel,
}

/// Accelerate, cruise and decelerate from `start_value` to `end_value`.
///
/// Each phase is an [`Extrapolator`] that is rebuilt only when a query lands
/// in a different phase than the previous one.
#[derive(Debug, Clone)]
pub struct AccelDecel<T> {
    curve: EaseCurve,
    start_time: f32,
    accel_time: f32,
    cruise_time: f32,
    decel_time: f32,
    start_value: T,
    end_value: T,
    speed: T,
    phase: Option<Phase>,
    extrapolator: Extrapolator<T>,
}

impl<T: Extrapolatable> AccelDecel<T> {
    pub fn new(
        curve: EaseCurve,
        start_time: f32,
        accel_time: f32,
        decel_time: f32,
        duration: f32,
        start_value: T,
        end_value: T,
    ) -> Self {
        let mut interpolator = Self {
            curve,
            start_time,
            accel_time: 0.0,
            cruise_time: 0.0,
            decel_time: 0.0,
            start_value,
            end_value,
            speed: T::default(),
            phase: None,
            extrapolator: Extrapolator::new(),
        };
        interpolator.init(start_time, accel_time, decel_time, duration, start_value, end_value);
        interpolator
    }

    pub fn linear(
        start_time: f32,
        accel_time: f32,
        decel_time: f32,
        duration: f32,
        start_value: T,
        end_value: T,
    ) -> Self {
        Self::new(EaseCurve::Linear, start_time, accel_time, decel_time, duration, start_value, end_value)
    }

    pub fn sine(
        start_time: f32,
        accel_time: f32,
        decel_time: f32,
        duration: f32,
        start_value: T,
        end_value: T,
    ) -> Self {
        Self::new(EaseCurve::Sine, start_time, accel_time, decel_time, duration, start_value, end_value)
    }

    pub fn init(
        &mut self,
        start_time: f32,
        accel_time: f32,
        decel_time: f32,
        duration: f32,
        start_value: T,
        end_value: T,
    ) {
        self.start_time = start_time;
        self.start_value = start_value;
        self.end_value = end_value;
        self.phase = None;

        if duration <= 0.0 {
            self.accel_time = 0.0;
            self.cruise_time = 0.0;
            self.decel_time = 0.0;
            self.speed = T::default();
            return;
        }

        let mut accel_time = accel_time.max(0.0);
        let mut decel_time = decel_time.max(0.0);
        if accel_time + decel_time > duration {
            accel_time = accel_time * duration / (accel_time + decel_time);
            decel_time = duration - accel_time;
        }
        self.accel_time = accel_time;
        self.decel_time = decel_time;
        self.cruise_time = duration - accel_time - decel_time;

        let factor = self.curve.displacement_factor();
        let effective = self.cruise_time + (accel_time + decel_time) * factor;
        self.speed = (end_value - start_value) * (1000.0 / effective);
    }

    pub fn evaluate(&mut self, time: f32) -> T {
        self.enter_phase(time);
        self.extrapolator.evaluate(time)
    }

    pub fn evaluate_speed(&mut self, time: f32) -> T {
        self.enter_phase(time);
        self.extrapolator.evaluate_speed(time)
    }

    fn enter_phase(&mut self, time: f32) {
        let elapsed = time - self.start_time;
        let phase = if elapsed < self.accel_time {
            Phase::Accel
        } else if elapsed < self.accel_time + self.cruise_time {
            Phase::Cruise
        } else {
            Phase::Decel
        };
        if self.phase == Some(phase) {
            return;
        }

        let zero = T::default();
        let factor = self.curve.displacement_factor();
        match phase {
            Phase::Accel => self.extrapolator.init(
                self.start_time,
                self.accel_time,
                self.start_value,
                zero,
                self.speed,
                self.curve.accel(),
            ),
            Phase::Cruise => self.extrapolator.init(
                self.start_time + self.accel_time,
                self.cruise_time,
                self.start_value + self.speed * (self.accel_time * MS_TO_SECONDS * factor),
                zero,
                self.speed,
                Extrapolation::LINEAR,
            ),
            Phase::Decel => self.extrapolator.init(
                self.start_time + self.accel_time + self.cruise_time,
                self.decel_time,
                self.end_value - self.speed * (self.decel_time * MS_TO_SECONDS * factor),
                zero,
                self.speed,
                self.curve.decel(),
            ),
        }
        self.phase = Some(phase);
    }

    pub fn is_done(&self, time: f32) -> bool {
        time >= self.end_time()
    }

    pub fn curve(&self) -> EaseCurve {
        self.curve
    }

    pub fn start_time(&self) -> f32 {
        self.start_time
    }

    pub fn set_start_time(&mut self, time: f32) {
        self.start_time = time;
        self.phase = None;
    }

    pub fn end_time(&self) -> f32 {
        self.start_time + self.duration()
    }

    pub fn duration(&self) -> f32 {
        self.accel_time + self.cruise_time + self.decel_time
    }

    pub fn acceleration(&self) -> f32 {
        self.accel_time
    }

    pub fn deceleration(&self) -> f32 {
        self.decel_time
    }

    pub fn start_value(&self) -> T {
        self.start_value
    }

    pub fn set_start_value(&mut self, value: T) {
        let duration = self.duration();
        let (accel, decel) = (self.accel_time, self.decel_time);
        self.init(self.start_time, accel, decel, duration, value, self.end_value);
    }

    pub fn end_value(&self) -> T {
        self.end_value
    }

    pub fn set_end_value(&mut self, value: T) {
        let duration = self.duration();
        let (accel, decel) = (self.accel_time, self.decel_time);
        self.init(self.start_time, accel, decel, duration, self.start_value, value);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;

    use super::*;

    const EPSILON: f32 = 1e-3;

    #[test]
    fn interpolator_blends_and_holds() {
        let mut i = Interpolator::new(100.0, 200.0, 0.0f32, 10.0);
        assert_eq!(i.evaluate(50.0), 0.0);
        assert!((i.evaluate(200.0) - 5.0).abs() < EPSILON);
        assert_eq!(i.evaluate(400.0), 10.0);
        assert!(i.is_done(300.0));
        assert!(!i.is_done(299.0));
    }

    #[test]
    fn interpolator_setters_invalidate() {
        let mut i = Interpolator::new(0.0, 100.0, 0.0f32, 10.0);
        assert_eq!(i.evaluate(100.0), 10.0);
        i.set_end_value(20.0);
        assert_eq!(i.evaluate(100.0), 20.0);
    }

    #[test]
    fn accel_decel_reaches_end_exactly() {
        for curve in [EaseCurve::Linear, EaseCurve::Sine] {
            let mut i = AccelDecel::new(curve, 0.0, 200.0, 300.0, 1000.0, 2.0f32, 12.0);
            assert!((i.evaluate(0.0) - 2.0).abs() < EPSILON, "{curve:?}");
            assert!((i.evaluate(1000.0) - 12.0).abs() < EPSILON, "{curve:?}");
            assert!((i.evaluate(5000.0) - 12.0).abs() < EPSILON, "{curve:?}");
        }
    }

    #[test]
    fn accel_decel_is_monotonic_and_continuous() {
        for curve in [EaseCurve::Linear, EaseCurve::Sine] {
            let mut i = AccelDecel::new(curve, 0.0, 250.0, 250.0, 1000.0, 0.0f32, 10.0);
            let mut previous = i.evaluate(0.0);
            for step in 1..=1000 {
                let value = i.evaluate(step as f32);
                assert!(value + 1e-5 >= previous, "{curve:?} went backwards at {step}");
                assert!(value - previous < 0.05, "{curve:?} jumped at {step}");
                previous = value;
            }
        }
    }

    #[test]
    fn cruise_speed_is_constant() {
        let mut i = AccelDecel::linear(0.0, 200.0, 200.0, 1000.0, 0.0f32, 8.0);
        let cruise = i.evaluate_speed(500.0);
        // 8 units over 600 ms cruise + 2 * 100 ms equivalent
        assert!((cruise - 10.0).abs() < EPSILON);
        assert!((i.evaluate_speed(300.0) - cruise).abs() < EPSILON);
    }

    #[test]
    fn overlong_ease_times_are_scaled() {
        let i = AccelDecel::linear(0.0, 600.0, 600.0, 800.0, 0.0f32, 1.0);
        assert!((i.acceleration() - 400.0).abs() < EPSILON);
        assert!((i.deceleration() - 400.0).abs() < EPSILON);
        assert!((i.duration() - 800.0).abs() < EPSILON);
    }

    #[test]
    fn zero_duration_jumps_to_end() {
        let mut i = AccelDecel::sine(100.0, 10.0, 10.0, 0.0, 1.0f32, 5.0);
        assert_eq!(i.evaluate(50.0), 1.0);
        assert_eq!(i.evaluate(100.0), 5.0);
        assert!(i.is_done(100.0));
    }

    #[test]
    fn retargeting_end_value_restarts_phases() {
        let mut i = AccelDecel::linear(0.0, 100.0, 100.0, 500.0, Vec2::ZERO, Vec2::X);
        assert!((i.evaluate(500.0) - Vec2::X).length() < EPSILON);
        i.set_end_value(Vec2::Y * 3.0);
        assert!((i.evaluate(500.0) - Vec2::Y * 3.0).length() < EPSILON);
    }
}
