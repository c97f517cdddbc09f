//! Scalar PID controller mapping a measured signal to a bounded integer
//! output. Used to drive concurrency toward a target CPU-utilization
//! setpoint.

use crate::config::PidGains;

#[derive(Debug, Clone)]
pub struct PIDController {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    integral: f64,
    last_error: Option<f64>,
    last_time_ms: Option<u64>,
    output_min: i64,
    output_max: i64,
}

impl PIDController {
    pub fn new(gains: PidGains, output_min: i64, output_max: i64) -> Self {
        Self {
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            setpoint: gains.setpoint,
            integral: 0.0,
            last_error: None,
            last_time_ms: None,
            output_min,
            output_max,
        }
    }

    /// Raise (or lower) the ceiling this controller clamps into, without
    /// resetting its accumulated integral/derivative state.
    pub fn set_output_max(&mut self, output_max: i64) {
        self.output_max = output_max;
    }

    /// Advance the controller with a new measurement at time `now_ms`.
    /// Returns the clamped integer output.
    pub fn update(&mut self, measured: f64, now_ms: u64) -> i64 {
        let error = self.setpoint - measured;
        let dt = match self.last_time_ms {
            Some(last) if now_ms > last => (now_ms - last) as f64 / 1000.0,
            Some(_) => 0.0,
            None => 1.0,
        };

        self.integral += error * dt;
        let derivative = if dt > 0.0 {
            (error - self.last_error.unwrap_or(error)) / dt
        } else {
            0.0
        };

        let raw = self.kp * error + self.ki * self.integral + self.kd * derivative;
        let output = raw.round() as i64;

        self.last_error = Some(error);
        self.last_time_ms = Some(now_ms);

        output.clamp(self.output_min, self.output_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_always_within_bounds() {
        let mut pid = PIDController::new(PidGains::default(), 1, 16);
        let mut t = 0u64;
        for measured in [0.0, 200.0, 50.0, 90.0, 120.0, -50.0] {
            t += 1000;
            let out = pid.update(measured, t);
            assert!(out >= 1 && out <= 16, "out of bounds: {out}");
        }
    }

    #[test]
    fn measured_at_setpoint_holds_at_the_output_floor() {
        let mut pid = PIDController::new(PidGains::default(), 1, 32);
        let mut t = 0u64;
        let mut last = 0;
        for _ in 0..5 {
            t += 1000;
            last = pid.update(90.0, t);
        }
        // measured == setpoint -> error is 0 every step -> raw output 0,
        // clamped up to the floor.
        assert_eq!(last, 1);
    }

    #[test]
    fn first_update_uses_a_one_second_implicit_dt() {
        let mut pid = PIDController::new(PidGains::default(), 1, 100);
        // error = 90 - 0 = 90; out = 0.5*90 + 0.05*90*1 + 0 = 49.5 -> 50 (round half away from zero in Rust is round-to-even? f64::round rounds half away from zero)
        let out = pid.update(0.0, 1000);
        assert_eq!(out, 50);
    }
}
