//! [`VelocityLimiter`] – magnitude caps for velocity commands.
//!
//! Unlike a hard speed-cap rule that rejects an over-limit twist, the limiter
//! *scales* it: a vector whose Euclidean magnitude exceeds the maximum is
//! multiplied by `max / |v|`, so the robot still moves in the requested
//! direction, just slower.  Linear and angular parts are limited
//! independently, each by its own maximum.

use fleet_types::{GatewayError, Vector3};

/// Output of [`VelocityLimiter::limit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitedVelocity {
    pub linear: Vector3,
    pub angular: Vector3,
    /// `true` when either part was scaled down.
    pub clamped: bool,
}

/// Caps the magnitude of linear and angular velocity vectors.
///
/// # Example
///
/// ```
/// use fleet_safety::VelocityLimiter;
/// use fleet_types::Vector3;
///
/// let limiter = VelocityLimiter::new(1.0, 0.5).unwrap();
/// let out = limiter
///     .limit(Vector3::new(2.0, 0.0, 0.0), Vector3::ZERO)
///     .unwrap();
///
/// assert!(out.clamped);
/// assert_eq!(out.linear.x, 1.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityLimiter {
    max_linear: f64,
    max_angular: f64,
}

impl VelocityLimiter {
    /// # Errors
    ///
    /// [`GatewayError::Config`] when either maximum is not a positive,
    /// finite number.
    pub fn new(max_linear: f64, max_angular: f64) -> Result<Self, GatewayError> {
        for (name, value) in [("max_linear", max_linear), ("max_angular", max_angular)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(GatewayError::Config(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        Ok(Self {
            max_linear,
            max_angular,
        })
    }

    pub fn max_linear(&self) -> f64 {
        self.max_linear
    }

    pub fn max_angular(&self) -> f64 {
        self.max_angular
    }

    /// Scale `linear` and `angular` down to their maxima.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidCommand`] when any component is NaN or
    /// infinite.
    pub fn limit(&self, linear: Vector3, angular: Vector3) -> Result<LimitedVelocity, GatewayError> {
        if !linear.is_finite() || !angular.is_finite() {
            return Err(GatewayError::InvalidCommand(
                "velocity components must be finite".to_string(),
            ));
        }
        let (linear, linear_clamped) = clamp_magnitude(linear, self.max_linear);
        let (angular, angular_clamped) = clamp_magnitude(angular, self.max_angular);
        Ok(LimitedVelocity {
            linear,
            angular,
            clamped: linear_clamped || angular_clamped,
        })
    }
}

fn clamp_magnitude(v: Vector3, max: f64) -> (Vector3, bool) {
    let norm = v.norm();
    if norm > max {
        (v.scale(max / norm), true)
    } else {
        (v, false)
    }
}
