//! Acquisition paths.
//!
//! A path is the ordered list of stepped positions visited during one
//! flyscan (one detector frame per point), plus an optional flying axis that
//! moves continuously from its start to its end at a fixed velocity while the
//! points are stepped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{FlyscanError, FlyscanResult};

/// Stepped motor targets for one point; may be empty for a pure time step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    /// Motor name to target position
    pub positions: BTreeMap<String, f64>,
}

impl PathPoint {
    /// Point with a single motor target
    pub fn single(motor: &str, position: f64) -> Self {
        Self {
            positions: BTreeMap::from([(motor.to_string(), position)]),
        }
    }
}

/// Motor given a velocity and moved once across the whole path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlyingAxis {
    /// Motor name
    pub motor: String,
    /// Position before acquisition starts
    pub start: f64,
    /// Target of the single continuous move
    pub end: f64,
    /// Velocity applied while staged (units/s)
    pub velocity: f64,
}

/// Ordered motion trajectory for one flyscan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPath {
    points: Vec<PathPoint>,
    flying: Option<FlyingAxis>,
}

impl AcquisitionPath {
    /// Path over explicit points
    pub fn from_points(points: Vec<PathPoint>) -> Self {
        Self {
            points,
            flying: None,
        }
    }

    /// `num_points` evenly spaced positions of `motor` from `start` to `stop`
    pub fn line(motor: &str, start: f64, stop: f64, num_points: usize) -> Self {
        let points = (0..num_points)
            .map(|i| PathPoint::single(motor, linspace_at(start, stop, num_points, i)))
            .collect();
        Self::from_points(points)
    }

    /// `num_points` points with no stepped motion (frames on the clock only)
    pub fn timed(num_points: usize) -> Self {
        Self::from_points(vec![PathPoint::default(); num_points])
    }

    /// Sweep `motor` from `start` to `end` at `velocity` during the path
    pub fn with_flying_motor(mut self, motor: &str, start: f64, end: f64, velocity: f64) -> Self {
        self.flying = Some(FlyingAxis {
            motor: motor.to_string(),
            start,
            end,
            velocity,
        });
        self
    }

    /// Number of points (and frames per detector)
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the path has no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Stepped points in order
    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    /// Flying axis, if any
    pub fn flying(&self) -> Option<&FlyingAxis> {
        self.flying.as_ref()
    }

    /// Every motor the path moves
    pub fn motors(&self) -> BTreeSet<String> {
        let mut motors: BTreeSet<String> = self
            .points
            .iter()
            .flat_map(|p| p.positions.keys().cloned())
            .collect();
        if let Some(flying) = &self.flying {
            motors.insert(flying.motor.clone());
        }
        motors
    }

    /// Where each motor must be before acquisition starts
    pub fn start_positions(&self) -> BTreeMap<String, f64> {
        let mut start = self
            .points
            .first()
            .map(|p| p.positions.clone())
            .unwrap_or_default();
        if let Some(flying) = &self.flying {
            start.insert(flying.motor.clone(), flying.start);
        }
        start
    }

    /// Check the path is non-empty, only names known motors and does not
    /// step its flying motor
    pub fn validate<'a, I>(&self, known_motors: I) -> FlyscanResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.points.is_empty() {
            return Err(FlyscanError::EmptyPath);
        }
        let known: BTreeSet<&str> = known_motors.into_iter().collect();
        for motor in self.motors() {
            if !known.contains(motor.as_str()) {
                return Err(FlyscanError::UnknownMotor(motor));
            }
        }
        if let Some(flying) = &self.flying {
            if !flying.velocity.is_finite() || flying.velocity <= 0.0 {
                return Err(FlyscanError::Configuration(format!(
                    "flying velocity for '{}' must be positive, got {}",
                    flying.motor, flying.velocity
                )));
            }
            if self
                .points
                .iter()
                .any(|p| p.positions.contains_key(&flying.motor))
            {
                return Err(FlyscanError::Configuration(format!(
                    "'{}' cannot be both flying and stepped",
                    flying.motor
                )));
            }
        }
        Ok(())
    }
}

fn linspace_at(start: f64, stop: f64, num_points: usize, i: usize) -> f64 {
    if num_points <= 1 {
        start
    } else {
        let step = (stop - start) / (num_points - 1) as f64;
        start + step * i as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_evenly_spaced() {
        let path = AcquisitionPath::line("x", 0.0, 1.0, 5);
        let xs: Vec<f64> = path.points().iter().map(|p| p.positions["x"]).collect();
        assert_eq!(xs, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(AcquisitionPath::line("x", 2.0, 9.0, 1).points()[0].positions["x"], 2.0);
    }

    #[test]
    fn start_positions_include_flying_axis() {
        let path = AcquisitionPath::line("y", 1.0, 2.0, 3).with_flying_motor("x", -1.0, 1.0, 0.5);
        let start = path.start_positions();
        assert_eq!(start["y"], 1.0);
        assert_eq!(start["x"], -1.0);
        assert_eq!(path.motors().len(), 2);
    }

    #[test]
    fn validation() {
        assert!(matches!(
            AcquisitionPath::timed(0).validate(["x"]),
            Err(FlyscanError::EmptyPath)
        ));
        assert!(matches!(
            AcquisitionPath::line("z", 0.0, 1.0, 2).validate(["x"]),
            Err(FlyscanError::UnknownMotor(m)) if m == "z"
        ));
        assert!(AcquisitionPath::timed(4)
            .with_flying_motor("x", 0.0, 1.0, 0.0)
            .validate(["x"])
            .is_err());
        AcquisitionPath::timed(4)
            .with_flying_motor("x", 0.0, 1.0, 0.5)
            .validate(["x"])
            .unwrap();
    }

    #[test]
    fn flying_motor_cannot_also_be_stepped() {
        let path = AcquisitionPath::line("x", 0.0, 1.0, 3).with_flying_motor("x", 0.0, 1.0, 0.5);
        assert!(matches!(
            path.validate(["x"]),
            Err(FlyscanError::Configuration(m)) if m.contains("'x'")
        ));
        AcquisitionPath::line("y", 0.0, 1.0, 3)
            .with_flying_motor("x", 0.0, 1.0, 0.5)
            .validate(["x", "y"])
            .unwrap();
    }
}
