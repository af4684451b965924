//! Moving volumetric heat source.
//!
//! The arc is modelled by Goldak's double-ellipsoid power density travelling
//! along a polyline weld path at constant speed:
//!
//! ```text
//! front (dx >= 0): q = 6√3 f_f η P / (a b c_f π√π) · exp(−3dx²/c_f² − 3dy²/a² − 3dz²/b²)
//! rear  (dx <  0): q = 6√3 f_r η P / (a b c_r π√π) · exp(−3dx²/c_r² − 3dy²/a² − 3dz²/b²)
//! ```
//!
//! `dz` is the depth below the surface along `depth_direction`; the density is
//! zero on the torch side (dz < 0), so the volume integral equals η·P when
//! f_f + f_r = 2. The source function is pure in (point, time).

use crate::error::{Error, Result};
use crate::types::{Point3, Vec3};
use serde::{Deserialize, Serialize};

/// Polyline the torch follows, in mesh coordinates (m).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeldPath {
    pub points: Vec<[f64; 3]>,
}

impl WeldPath {
    /// Straight path between two points.
    pub fn straight(start: [f64; 3], end: [f64; 3]) -> Self {
        Self {
            points: vec![start, end],
        }
    }

    fn point(&self, i: usize) -> Point3 {
        Point3::from(self.points[i])
    }

    /// Total arc length.
    pub fn length(&self) -> f64 {
        (1..self.points.len())
            .map(|i| (self.point(i) - self.point(i - 1)).norm())
            .sum()
    }
}

/// Process parameters of one weld pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatSourceSpec {
    /// Arc voltage (V).
    pub voltage: f64,
    /// Arc current (A).
    pub current: f64,
    /// Arc efficiency η in (0, 1].
    pub efficiency: f64,
    /// Travel speed along the path (m/s).
    pub travel_speed: f64,
    /// Front semi-axis c_f (m).
    pub front_length: f64,
    /// Rear semi-axis c_r (m).
    pub rear_length: f64,
    /// Lateral semi-axis a (m).
    pub half_width: f64,
    /// Depth semi-axis b (m).
    pub depth: f64,
    /// Front power fraction f_f; derived from the semi-axes when omitted.
    #[serde(default)]
    pub front_fraction: Option<f64>,
    /// Rear power fraction f_r; derived from the semi-axes when omitted.
    #[serde(default)]
    pub rear_fraction: Option<f64>,
    pub path: WeldPath,
    /// Time the torch starts moving (s).
    #[serde(default)]
    pub start_time: f64,
    /// Direction pointing into the material from the torch.
    #[serde(default = "default_depth_direction")]
    pub depth_direction: [f64; 3],
    /// Length over which the travel direction is blended across a path vertex.
    #[serde(default)]
    pub corner_blend: Option<f64>,
}

fn default_depth_direction() -> [f64; 3] {
    [0.0, 0.0, -1.0]
}

impl HeatSourceSpec {
    /// Arc power P = V·I (W).
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// Time at which the torch leaves the end of the path.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.path.length() / self.travel_speed
    }

    /// Front and rear power fractions summing to 2.
    pub fn fractions(&self) -> Result<(f64, f64)> {
        let (cf, cr) = (self.front_length, self.rear_length);
        let (ff, fr) = match (self.front_fraction, self.rear_fraction) {
            (None, None) => (2.0 * cf / (cf + cr), 2.0 * cr / (cf + cr)),
            (Some(ff), None) => (ff, 2.0 - ff),
            (None, Some(fr)) => (2.0 - fr, fr),
            (Some(ff), Some(fr)) => {
                if (ff + fr - 2.0).abs() > 1e-9 {
                    return Err(Error::InvalidHeatSource(format!(
                        "power fractions must sum to 2, got {} + {}",
                        ff, fr
                    )));
                }
                (ff, fr)
            }
        };
        if !(ff > 0.0 && fr > 0.0) {
            return Err(Error::InvalidHeatSource(format!(
                "power fractions must be positive, got f_f = {}, f_r = {}",
                ff, fr
            )));
        }
        Ok((ff, fr))
    }

    /// Check process parameters and path geometry.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("voltage", self.voltage),
            ("current", self.current),
            ("travel_speed", self.travel_speed),
            ("front_length", self.front_length),
            ("rear_length", self.rear_length),
            ("half_width", self.half_width),
            ("depth", self.depth),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::InvalidHeatSource(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        if !(self.efficiency > 0.0 && self.efficiency <= 1.0) {
            return Err(Error::InvalidHeatSource(format!(
                "efficiency must lie in (0, 1], got {}",
                self.efficiency
            )));
        }
        if !self.start_time.is_finite() {
            return Err(Error::InvalidHeatSource("start_time must be finite".into()));
        }
        if let Some(blend) = self.corner_blend {
            if !(blend.is_finite() && blend >= 0.0) {
                return Err(Error::InvalidHeatSource(
                    "corner_blend must be non-negative".into(),
                ));
            }
        }
        self.fractions()?;

        let depth = Vec3::from(self.depth_direction);
        if !(depth.norm() > 0.0) || !depth.iter().all(|c| c.is_finite()) {
            return Err(Error::InvalidHeatSource(
                "depth_direction must be a non-zero vector".into(),
            ));
        }
        let depth = depth.normalize();

        let path = &self.path;
        if path.points.len() < 2 {
            return Err(Error::InvalidHeatSource(
                "weld path needs at least two points".into(),
            ));
        }
        if path.points.iter().flatten().any(|c| !c.is_finite()) {
            return Err(Error::InvalidHeatSource(
                "weld path has non-finite coordinates".into(),
            ));
        }
        for i in 1..path.points.len() {
            let segment = path.point(i) - path.point(i - 1);
            let length = segment.norm();
            if length <= 0.0 {
                return Err(Error::InvalidHeatSource(format!(
                    "weld path segment {} has zero length",
                    i - 1
                )));
            }
            let along = segment - depth * segment.dot(&depth);
            if along.norm() <= 1e-9 * length {
                return Err(Error::InvalidHeatSource(format!(
                    "weld path segment {} is parallel to the depth direction",
                    i - 1
                )));
            }
        }
        Ok(())
    }
}

/// Any pure volumetric power density q(x, t) (W/m³).
pub trait HeatSource: Send + Sync {
    /// Power density at `point` and `time`.
    fn flux_at(&self, point: &Point3, time: f64) -> f64;

    /// Time after which the source is permanently zero.
    fn active_until(&self) -> f64;

    /// True while the source may deposit heat.
    fn is_active(&self, time: f64) -> bool {
        time <= self.active_until()
    }
}

/// Local frame of the torch at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceFrame {
    pub center: Point3,
    /// Unit travel direction, orthogonal to `depth`.
    pub travel: Vec3,
    /// Unit lateral direction.
    pub lateral: Vec3,
    /// Unit depth direction.
    pub depth: Vec3,
}

/// Goldak double-ellipsoid source moving along a [`WeldPath`].
#[derive(Debug, Clone)]
pub struct GoldakSource {
    spec: HeatSourceSpec,
    /// Arc length at each path vertex.
    cumulative: Vec<f64>,
    /// Unit direction of each segment.
    directions: Vec<Vec3>,
    depth: Vec3,
    front_peak: f64,
    rear_peak: f64,
}

impl GoldakSource {
    /// Validate the process parameters and precompute path data.
    pub fn new(spec: HeatSourceSpec) -> Result<Self> {
        spec.validate()?;
        let (ff, fr) = spec.fractions()?;

        let path = &spec.path;
        let mut cumulative = vec![0.0];
        let mut directions = Vec::with_capacity(path.points.len() - 1);
        for i in 1..path.points.len() {
            let segment = path.point(i) - path.point(i - 1);
            let length = segment.norm();
            cumulative.push(cumulative[i - 1] + length);
            directions.push(segment / length);
        }

        let qp = spec.efficiency * spec.power();
        let norm = 6.0 * 3.0_f64.sqrt() / (std::f64::consts::PI * std::f64::consts::PI.sqrt());
        let ab = spec.half_width * spec.depth;
        let front_peak = norm * ff * qp / (ab * spec.front_length);
        let rear_peak = norm * fr * qp / (ab * spec.rear_length);

        let depth = Vec3::from(spec.depth_direction).normalize();

        Ok(Self {
            spec,
            cumulative,
            directions,
            depth,
            front_peak,
            rear_peak,
        })
    }

    /// The process parameters.
    pub fn spec(&self) -> &HeatSourceSpec {
        &self.spec
    }

    /// Torch frame at `time`, or `None` while the source is inactive.
    pub fn frame_at(&self, time: f64) -> Option<SourceFrame> {
        if time < self.spec.start_time || time > self.active_until() {
            return None;
        }
        let total = self.cumulative[self.cumulative.len() - 1];
        let s = ((time - self.spec.start_time) * self.spec.travel_speed).clamp(0.0, total);

        // Segment containing s
        let seg = self
            .cumulative
            .partition_point(|&c| c <= s)
            .saturating_sub(1)
            .min(self.directions.len() - 1);
        let local = s - self.cumulative[seg];
        let center = self.spec.path.point(seg) + self.directions[seg] * local;

        let direction = self.blended_direction(s, seg);
        let travel = (direction - self.depth * direction.dot(&self.depth)).normalize();
        let lateral = self.depth.cross(&travel);

        Some(SourceFrame {
            center,
            travel,
            lateral,
            depth: self.depth,
        })
    }

    /// Travel direction at arc length `s`, blended near interior vertices.
    fn blended_direction(&self, s: f64, seg: usize) -> Vec3 {
        let blend = match self.spec.corner_blend {
            Some(b) if b > 0.0 => b,
            _ => return self.directions[seg],
        };

        // Nearest interior vertex: start or end of the current segment
        let candidates = [seg, seg + 1];
        for v in candidates {
            if v == 0 || v >= self.directions.len() {
                continue;
            }
            let before = self.cumulative[v] - self.cumulative[v - 1];
            let after = self.cumulative[v + 1] - self.cumulative[v];
            let half = (0.5 * blend).min(0.5 * before).min(0.5 * after);
            let offset = s - self.cumulative[v];
            if half > 0.0 && offset.abs() < half {
                let w = 0.5 + 0.5 * offset / half;
                let mixed = self.directions[v - 1] * (1.0 - w) + self.directions[v] * w;
                if mixed.norm() > 1e-12 {
                    return mixed.normalize();
                }
                return self.directions[v];
            }
        }
        self.directions[seg]
    }
}

impl HeatSource for GoldakSource {
    fn flux_at(&self, point: &Point3, time: f64) -> f64 {
        let frame = match self.frame_at(time) {
            Some(f) => f,
            None => return 0.0,
        };
        let d = point - frame.center;
        let dz = d.dot(&frame.depth);
        if dz < 0.0 {
            return 0.0;
        }
        let dx = d.dot(&frame.travel);
        let dy = d.dot(&frame.lateral);

        let (peak, c) = if dx >= 0.0 {
            (self.front_peak, self.spec.front_length)
        } else {
            (self.rear_peak, self.spec.rear_length)
        };
        let a = self.spec.half_width;
        let b = self.spec.depth;
        peak * (-3.0 * (dx * dx / (c * c) + dy * dy / (a * a) + dz * dz / (b * b))).exp()
    }

    fn active_until(&self) -> f64 {
        self.spec.end_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::gauss::gauss_1d;
    use approx::assert_relative_eq;

    fn spec() -> HeatSourceSpec {
        HeatSourceSpec {
            voltage: 25.0,
            current: 200.0,
            efficiency: 0.8,
            travel_speed: 0.005,
            front_length: 0.004,
            rear_length: 0.008,
            half_width: 0.004,
            depth: 0.003,
            front_fraction: None,
            rear_fraction: None,
            path: WeldPath::straight([0.0, 0.0, 0.0], [0.1, 0.0, 0.0]),
            start_time: 0.0,
            depth_direction: [0.0, 0.0, -1.0],
            corner_blend: None,
        }
    }

    /// Composite Gauss rule on [lo, hi] split at the given breakpoints.
    fn composite(lo: f64, hi: f64, pieces: usize) -> Vec<(f64, f64)> {
        let rule = gauss_1d(5);
        let h = (hi - lo) / pieces as f64;
        let mut out = Vec::with_capacity(pieces * rule.len());
        for p in 0..pieces {
            let a = lo + p as f64 * h;
            for &(x, w) in &rule {
                out.push((a + 0.5 * h * (x + 1.0), 0.5 * h * w));
            }
        }
        out
    }

    #[test]
    fn test_volume_integral_equals_absorbed_power() {
        let spec = spec();
        let source = GoldakSource::new(spec.clone()).unwrap();
        let t = 10.0;
        let center = source.frame_at(t).unwrap().center;

        // Split at dx = 0 where the two ellipsoid halves meet
        let mut xs = composite(-6.0 * spec.rear_length, 0.0, 12);
        xs.extend(composite(0.0, 6.0 * spec.front_length, 12));
        let ys = composite(-6.0 * spec.half_width, 6.0 * spec.half_width, 24);
        let zs = composite(-6.0 * spec.depth, 0.0, 12);

        let mut total = 0.0;
        for &(x, wx) in &xs {
            for &(y, wy) in &ys {
                for &(z, wz) in &zs {
                    let p = center + Vec3::new(x, y, z);
                    total += wx * wy * wz * source.flux_at(&p, t);
                }
            }
        }
        assert_relative_eq!(total, 0.8 * 25.0 * 200.0, max_relative = 1e-6);
    }

    #[test]
    fn test_default_fractions_are_continuous() {
        let spec = spec();
        let (ff, fr) = spec.fractions().unwrap();
        assert_relative_eq!(ff + fr, 2.0, epsilon = 1e-14);

        let source = GoldakSource::new(spec).unwrap();
        let c = source.frame_at(2.0).unwrap().center;
        let eps = 1e-9;
        let front = source.flux_at(&(c + Vec3::new(eps, 0.0, -1e-4)), 2.0);
        let rear = source.flux_at(&(c + Vec3::new(-eps, 0.0, -1e-4)), 2.0);
        assert_relative_eq!(front, rear, max_relative = 1e-6);
    }

    #[test]
    fn test_source_moves_and_switches_off() {
        let source = GoldakSource::new(spec()).unwrap();
        assert_relative_eq!(source.active_until(), 20.0, epsilon = 1e-12);

        let frame = source.frame_at(4.0).unwrap();
        assert_relative_eq!(frame.center, Point3::new(0.02, 0.0, 0.0), epsilon = 1e-12);

        assert!(source.flux_at(&Point3::new(0.02, 0.0, -0.001), 4.0) > 0.0);
        // Torch side of the surface
        assert_eq!(source.flux_at(&Point3::new(0.02, 0.0, 0.001), 4.0), 0.0);
        // Cooling phase
        assert_eq!(source.flux_at(&Point3::new(0.1, 0.0, 0.0), 20.5), 0.0);
        assert!(!source.is_active(20.5));
    }

    #[test]
    fn test_explicit_fractions_must_sum_to_two() {
        let mut s = spec();
        s.front_fraction = Some(0.6);
        s.rear_fraction = Some(1.0);
        assert!(matches!(
            GoldakSource::new(s),
            Err(Error::InvalidHeatSource(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_parameters() {
        let mut s = spec();
        s.efficiency = 1.2;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.path = WeldPath {
            points: vec![[0.0, 0.0, 0.0]],
        };
        assert!(s.validate().is_err());

        let mut s = spec();
        s.path = WeldPath::straight([0.0, 0.0, 0.0], [0.0, 0.0, 0.01]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_corner_blend() {
        let mut s = spec();
        s.path = WeldPath {
            points: vec![[0.0, 0.0, 0.0], [0.05, 0.0, 0.0], [0.05, 0.05, 0.0]],
        };

        let sharp = GoldakSource::new(s.clone()).unwrap();
        // Just past the corner the sharp source already travels along +y
        let t_after = 0.0501 / s.travel_speed;
        assert_relative_eq!(
            sharp.frame_at(t_after).unwrap().travel,
            Vec3::new(0.0, 1.0, 0.0),
            epsilon = 1e-12
        );

        s.corner_blend = Some(0.01);
        let blended = GoldakSource::new(s.clone()).unwrap();
        let at_vertex = blended.frame_at(0.05 / s.travel_speed).unwrap().travel;
        let diag = 0.5_f64.sqrt();
        assert_relative_eq!(at_vertex, Vec3::new(diag, diag, 0.0), epsilon = 1e-9);

        // Outside the blend window the segment direction is used
        let far = blended.frame_at(0.03 / s.travel_speed).unwrap().travel;
        assert_relative_eq!(far, Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_spec_from_toml() {
        let text = r#"
            voltage = 24.0
            current = 180.0
            efficiency = 0.75
            travel_speed = 0.004
            front_length = 0.003
            rear_length = 0.006
            half_width = 0.003
            depth = 0.002
            path = { points = [[0.0, 0.0, 0.0], [0.05, 0.0, 0.0]] }
        "#;
        let spec: HeatSourceSpec = toml::from_str(text).unwrap();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.depth_direction, [0.0, 0.0, -1.0]);
        assert_relative_eq!(spec.end_time(), 12.5, epsilon = 1e-12);
    }
}
