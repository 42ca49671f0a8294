use chrono::{DateTime, Utc};

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance at which proximity stops contributing (10 miles).
pub const PROXIMITY_CAP_KM: f64 = 16.09;

/// Score floor for long-idle users; below this the signal is noise.
const RECENCY_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Jaccard coefficient over two interest bitsets. The shorter operand is
/// treated as zero-padded to the longer length. An empty union scores 0.
pub fn jaccard(a: &[u8], b: &[u8]) -> f64 {
    let len = a.len().max(b.len());
    let mut intersection = 0u32;
    let mut union = 0u32;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        intersection += (x & y).count_ones();
        union += (x | y).count_ones();
    }
    if union == 0 {
        0.0
    } else {
        f64::from(intersection) / f64::from(union)
    }
}

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Proximity component: 1 at zero distance, linearly down to 0 at
/// [`PROXIMITY_CAP_KM`]. Missing coordinates on either side score 0.
pub fn geo_score(candidate: Option<GeoPoint>, requester: Option<GeoPoint>) -> f64 {
    match (candidate, requester) {
        (Some(c), Some(r)) => {
            let distance = haversine_km(c, r);
            (1.0 - distance / PROXIMITY_CAP_KM).max(0.0)
        }
        _ => 0.0,
    }
}

/// Recency component plus the whole minutes since last seen. A user seen
/// this minute scores 1; otherwise `exp(-m/60)` floored at
/// [`RECENCY_FLOOR`]. An unknown `last_seen` scores 0 and reports -1.
pub fn recency_score(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> (f64, i64) {
    let Some(seen) = last_seen else {
        return (0.0, -1);
    };
    let minutes = (now - seen).num_minutes().max(0);
    if minutes == 0 {
        return (1.0, 0);
    }
    let score = (-(minutes as f64) / 60.0).exp().max(RECENCY_FLOOR);
    (score, minutes)
}
