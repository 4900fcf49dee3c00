//! `carscout-spatial` – where the vehicles are.
//!
//! Answers "which vehicles are closest to this point?" on a sphere.
//!
//! # Modules
//!
//! - [`distance`] – haversine central angle between two latitude/longitude
//!   pairs, plus metre/radian conversions on a mean-radius Earth.
//! - [`kdtree`] – [`SpatialIndex`][kdtree::SpatialIndex]: an immutable,
//!   balanced kd-tree over (latitude, longitude) answering nearest-k and
//!   within-radius queries with exact great-circle ranking.

pub mod distance;
pub mod kdtree;

pub use distance::{
    EARTH_RADIUS_M, central_angle, central_angle_deg, metres_to_radians, radians_to_metres,
};
pub use kdtree::SpatialIndex;
