//! PID controller for the dew-heater channels.
//!
//! Value type with owned state: `compute(input, setpoint, dt)` returns
//! the clamped output. Direction is "direct" (positive error raises the
//! output), matching a resistive heater. Tunings can be re-applied every
//! tick; doing so never touches the integrator, so a host re-sending
//! unchanged gains does not bump the loop.

pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    prev_error: f64,
    output_min: f64,
    output_max: f64,
}

impl Pid {
    /// Output limits default to the heater power range [0, 100].
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            prev_error: 0.0,
            output_min: 0.0,
            output_max: 100.0,
        }
    }

    /// Set output limits.
    pub fn set_limits(&mut self, min: f64, max: f64) {
        self.output_min = min;
        self.output_max = max;
    }

    /// Re-apply tuning constants. Internal state is preserved.
    pub fn set_tunings(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Compute the controller output for one sample period.
    pub fn compute(&mut self, input: f64, setpoint: f64, dt: f64) -> f64 {
        let error = setpoint - input;

        // Proportional
        let p = self.kp * error;

        // Integral (with anti-windup)
        self.integral += error * dt;
        let i = self.ki * self.integral;

        // Derivative
        let derivative = if dt > 0.0 {
            (error - self.prev_error) / dt
        } else {
            0.0
        };
        let d = self.kd * derivative;

        self.prev_error = error;

        // Clamp output
        let output = (p + i + d).clamp(self.output_min, self.output_max);

        // Anti-windup: if output is saturated, stop integrating
        if output >= self.output_max || output <= self.output_min {
            self.integral -= error * dt;
        }

        output
    }

    /// Reset controller state.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
    }
}
