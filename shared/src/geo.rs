//! Viewport geometry and text filters over location collections.
//!
//! Everything here is pure: inputs are borrowed, results are fresh vectors.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::model::{BoundingBox, Location};
use crate::{GREAT_CIRCLE_RADIUS_M, METERS_PER_MILE};

/// Search circle derived from two viewport corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub radius_miles: f64,
    pub center_latitude: f64,
    pub center_longitude: f64,
}

/// Great-circle distance in meters (haversine).
#[must_use]
pub fn great_circle_distance(lat1: f64, long1: f64, lat2: f64, long2: f64) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (lat1 - lat2).abs() < EPSILON && (long1 - long2).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_long = (long2 - long1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_long / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);

    let result = GREAT_CIRCLE_RADIUS_M * 2.0 * a.sqrt().asin();

    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

#[must_use]
pub fn distance_miles(lat1: f64, long1: f64, lat2: f64, long2: f64) -> f64 {
    great_circle_distance(lat1, long1, lat2, long2) / METERS_PER_MILE
}

/// Radius is half the corner-to-corner distance. When the second longitude is
/// smaller than the first the pair straddles ±180°, so the center is pushed
/// by 180°.
#[must_use]
pub fn compute_circle(lat1: f64, long1: f64, lat2: f64, long2: f64) -> Circle {
    let radius_miles = distance_miles(lat1, long1, lat2, long2) / 2.0;
    let center_latitude = (lat1 + lat2) / 2.0;
    let mean_longitude = (long1 + long2) / 2.0;
    let center_longitude = if long2 < long1 {
        180.0 + mean_longitude
    } else {
        mean_longitude
    };

    Circle {
        radius_miles,
        center_latitude,
        center_longitude,
    }
}

impl BoundingBox {
    /// Circle through the south-west and north-east corners.
    #[must_use]
    pub fn circle(&self) -> Circle {
        compute_circle(self.south, self.west, self.north, self.east)
    }

    /// `east <= west` selects the antimeridian branch.
    #[must_use]
    pub fn wraps(&self) -> bool {
        self.east <= self.west
    }

    fn contains_latitude(&self, latitude: f64) -> bool {
        latitude >= self.south && latitude <= self.north
    }

    #[must_use]
    pub fn contains_plain(&self, latitude: f64, longitude: f64) -> bool {
        self.contains_latitude(latitude) && longitude >= self.west && longitude <= self.east
    }

    #[must_use]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        if self.wraps() {
            self.contains_latitude(latitude)
                && ((longitude >= self.west && longitude <= 180.0)
                    || (longitude >= -180.0 && longitude <= self.east))
        } else {
            self.contains_plain(latitude, longitude)
        }
    }
}

/// Keeps locations inside the box, wrapping across ±180° when `east <= west`.
/// No box means no filtering.
#[must_use]
pub fn limit_geographically(locations: &[Location], bounds: Option<&BoundingBox>) -> Vec<Location> {
    let Some(bounds) = bounds else {
        return locations.to_vec();
    };

    let kept: Vec<Location> = locations
        .iter()
        .filter(|l| bounds.contains(l.latitude, l.longitude))
        .cloned()
        .collect();

    debug!(
        total = locations.len(),
        kept = kept.len(),
        wraps = bounds.wraps(),
        "limited locations to viewport"
    );
    kept
}

/// Plain box filter with no wrap handling.
#[must_use]
pub fn limit_to_box(locations: &[Location], bounds: &BoundingBox) -> Vec<Location> {
    locations
        .iter()
        .filter(|l| bounds.contains_plain(l.latitude, l.longitude))
        .cloned()
        .collect()
}

#[must_use]
pub fn limit_by_radius(
    locations: &[Location],
    radius_miles: f64,
    center_latitude: f64,
    center_longitude: f64,
) -> Vec<Location> {
    if radius_miles <= 0.0 {
        return locations.to_vec();
    }

    locations
        .iter()
        .filter(|l| {
            distance_miles(center_latitude, center_longitude, l.latitude, l.longitude)
                <= radius_miles
        })
        .cloned()
        .collect()
}

#[must_use]
pub fn limit_by_search(locations: &[Location], term: &str) -> Vec<Location> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return locations.to_vec();
    }

    locations
        .iter()
        .filter(|l| l.title.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

fn by_title(a: &Location, b: &Location) -> Ordering {
    a.title
        .to_lowercase()
        .cmp(&b.title.to_lowercase())
        .then_with(|| a.title.cmp(&b.title))
}

#[must_use]
pub fn sort_by_title(mut locations: Vec<Location>) -> Vec<Location> {
    locations.sort_by(by_title);
    locations
}

/// Near/far split of a title search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSplit {
    pub local: Vec<Location>,
    pub other: Vec<Location>,
}

/// Matches are local when they fall inside the viewport's circle, other
/// otherwise. With no viewport everything matched is local.
#[must_use]
pub fn split_search(locations: &[Location], term: &str, viewport: Option<&BoundingBox>) -> SearchSplit {
    let matched = limit_by_search(locations, term);

    let local = match viewport {
        Some(bounds) => {
            let circle = bounds.circle();
            limit_by_radius(
                &matched,
                circle.radius_miles,
                circle.center_latitude,
                circle.center_longitude,
            )
        }
        None => matched.clone(),
    };

    let local_ids: HashSet<_> = local.iter().filter_map(|l| l.id).collect();
    let other = matched
        .into_iter()
        .filter(|l| l.id.map_or(true, |id| !local_ids.contains(&id)))
        .filter(|l| l.id.is_some() || !local.contains(l))
        .collect();

    SearchSplit {
        local: sort_by_title(local),
        other: sort_by_title(other),
    }
}
