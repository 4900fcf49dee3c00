//! Great-circle distance.
//!
//! Distances are central angles in radians computed with the haversine
//! formula.  Convert to ground distance with [`radians_to_metres`].

use carscout_types::VehiclePoint;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Central angle (radians) between two latitude/longitude pairs in degrees.
pub fn central_angle_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let sin_dphi = (d_phi * 0.5).sin();
    let sin_dlambda = (d_lambda * 0.5).sin();
    let a = sin_dphi * sin_dphi + phi1.cos() * phi2.cos() * sin_dlambda * sin_dlambda;
    // Rounding can push `a` a hair outside [0, 1] for antipodal points.
    let a = a.clamp(0.0, 1.0);
    2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Central angle (radians) between two points.
pub fn central_angle(a: &VehiclePoint, b: &VehiclePoint) -> f64 {
    central_angle_deg(a.latitude, a.longitude, b.latitude, b.longitude)
}

pub fn metres_to_radians(metres: f64) -> f64 {
    metres / EARTH_RADIUS_M
}

pub fn radians_to_metres(radians: f64) -> f64 {
    radians * EARTH_RADIUS_M
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lon: f64) -> VehiclePoint {
        VehiclePoint::new("p", lat, lon)
    }

    #[test]
    fn identical_points_have_zero_distance() {
        for &(lat, lon) in &[(0.0, 0.0), (52.52, 13.405), (-89.9, 179.9), (90.0, 0.0)] {
            assert_eq!(central_angle(&p(lat, lon), &p(lat, lon)), 0.0);
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let pairs = [
            ((52.52, 13.405), (48.85, 2.35)),
            ((-33.86, 151.2), (40.71, -74.0)),
            ((0.0, 179.5), (0.0, -179.5)),
        ];
        for ((a_lat, a_lon), (b_lat, b_lon)) in pairs {
            let ab = central_angle(&p(a_lat, a_lon), &p(b_lat, b_lon));
            let ba = central_angle(&p(b_lat, b_lon), &p(a_lat, a_lon));
            assert!((ab - ba).abs() < 1e-15, "{ab} != {ba}");
        }
    }

    #[test]
    fn berlin_to_paris_is_about_878_km() {
        let d = radians_to_metres(central_angle(&p(52.52, 13.405), &p(48.85, 2.35)));
        assert!((d - 878_000.0).abs() < 5_000.0, "got {d}");
    }

    #[test]
    fn antipodal_points_are_pi_apart() {
        let d = central_angle(&p(0.0, 0.0), &p(0.0, 180.0));
        assert!((d - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn antimeridian_neighbours_are_close() {
        let d = radians_to_metres(central_angle(&p(0.0, 179.9), &p(0.0, -179.9)));
        assert!(d < 25_000.0, "got {d}");
    }

    #[test]
    fn triangle_inequality_holds() {
        let a = p(52.52, 13.405);
        let b = p(48.85, 2.35);
        let c = p(41.9, 12.5);
        let ab = central_angle(&a, &b);
        let bc = central_angle(&b, &c);
        let ac = central_angle(&a, &c);
        assert!(ac <= ab + bc + 1e-12);
        assert!(ab <= ac + bc + 1e-12);
        assert!(bc <= ab + ac + 1e-12);
    }

    #[test]
    fn metre_conversion_roundtrip() {
        let r = metres_to_radians(150.0);
        assert!((radians_to_metres(r) - 150.0).abs() < 1e-9);
    }
}
