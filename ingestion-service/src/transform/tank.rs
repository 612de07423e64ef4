//! Liquid volume of a horizontal cylindrical tank with an elliptical
//! cross-section, measured by a top-down probe.

use std::f64::consts::PI;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum GeometryError {
    #[error("internal {dimension} must be positive, got {value} cm")]
    NonPositive { dimension: &'static str, value: f64 },
}

/// Outer dimensions and wall thickness, all in centimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TankGeometry {
    semi_a: f64,
    semi_b: f64,
    internal_length: f64,
}

impl TankGeometry {
    pub fn new(width_cm: f64, height_cm: f64, length_cm: f64, wall_cm: f64) -> Result<Self, GeometryError> {
        let semi_a = (width_cm - 2.0 * wall_cm) / 2.0;
        let semi_b = (height_cm - 2.0 * wall_cm) / 2.0;
        let internal_length = length_cm - 2.0 * wall_cm;

        for (dimension, value) in [
            ("width", semi_a),
            ("height", semi_b),
            ("length", internal_length),
        ] {
            // NaN fails this comparison too
            if !(value > 0.0) {
                return Err(GeometryError::NonPositive { dimension, value });
            }
        }

        Ok(Self {
            semi_a,
            semi_b,
            internal_length,
        })
    }

    /// Internal fill height at which the tank is full, in cm.
    pub fn full_height_cm(&self) -> f64 {
        2.0 * self.semi_b
    }

    pub fn capacity_liters(&self) -> f64 {
        PI * self.semi_a * self.semi_b * self.internal_length / 1000.0
    }

    /// Volume for a probe reading in millimetres. Readings below empty or
    /// above full are clamped.
    pub fn volume_liters(&self, probe_mm: f64) -> f64 {
        let h = probe_mm / 10.0;
        if h.is_nan() {
            return 0.0;
        }
        let h = h.clamp(0.0, self.full_height_cm());

        let area = segment_area(self.semi_b, h) * (self.semi_a / self.semi_b);
        let volume = area * self.internal_length / 1000.0;
        volume.clamp(0.0, self.capacity_liters())
    }
}

/// Area of a circular segment of radius `r` filled to height `h`.
fn segment_area(r: f64, h: f64) -> f64 {
    let d = r - h;
    let cos_theta = (d / r).clamp(-1.0, 1.0);
    r * r * cos_theta.acos() - d * (2.0 * r * h - h * h).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    fn default_short_tank() -> TankGeometry {
        TankGeometry::new(155.0, 155.0, 246.0, 0.6).unwrap()
    }

    #[test]
    fn empty_and_full() {
        let tank = default_short_tank();
        let full = PI * 76.9 * 76.9 * 244.8 / 1000.0;

        assert_eq!(tank.volume_liters(0.0), 0.0);
        assert!(close(tank.capacity_liters(), full));
        assert!(close(tank.volume_liters(tank.full_height_cm() * 10.0), full));
    }

    #[test]
    fn half_height_is_half_capacity() {
        let tank = default_short_tank();
        let half = tank.volume_liters(tank.full_height_cm() * 5.0);
        assert!(close(half, tank.capacity_liters() / 2.0));
    }

    #[test]
    fn out_of_range_probes_are_clamped() {
        let tank = default_short_tank();
        assert_eq!(tank.volume_liters(-50.0), 0.0);
        assert_eq!(tank.volume_liters(f64::NAN), 0.0);
        assert!(close(tank.volume_liters(99_999.0), tank.capacity_liters()));
    }

    #[test]
    fn elliptical_section_scales_with_width() {
        let round = TankGeometry::new(100.0, 100.0, 200.0, 0.0).unwrap();
        let wide = TankGeometry::new(200.0, 100.0, 200.0, 0.0).unwrap();
        assert!(close(wide.volume_liters(300.0), 2.0 * round.volume_liters(300.0)));
    }

    #[test]
    fn volume_grows_with_fill() {
        let tank = default_short_tank();
        let mut last = 0.0;
        for mm in (0..=1540).step_by(10) {
            let v = tank.volume_liters(mm as f64);
            assert!(v >= last, "{mm} mm: {v} < {last}");
            last = v;
        }
    }

    #[test]
    fn walls_thicker_than_the_tank_are_rejected() {
        assert_eq!(
            TankGeometry::new(155.0, 155.0, 246.0, 80.0),
            Err(GeometryError::NonPositive {
                dimension: "width",
                value: -2.5,
            })
        );
        assert!(matches!(
            TankGeometry::new(155.0, 155.0, 1.0, 0.6),
            Err(GeometryError::NonPositive { dimension: "length", .. })
        ));
    }
}
