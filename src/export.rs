//! Downstream formats for parking spaces.

use crate::{
    polygon::open_ring,
    reconcile::{ParkingSpace, SpaceStatus},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::io::Write;

/// GeoJSON `FeatureCollection`, one `Polygon` feature per space, `[lng, lat]`.
pub fn to_geojson(spaces: &[ParkingSpace]) -> Value {
    let features: Vec<Value> = spaces
        .iter()
        .map(|space| {
            let ring: Vec<[f64; 2]> = space
                .geo_polygon
                .iter()
                .map(|point| [point.lng, point.lat])
                .collect();

            json!({
                "type": "Feature",
                "id": space.id,
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [ring],
                },
                "properties": {
                    "id": space.id,
                    "status": space.status,
                    "confidence": space.confidence,
                    "vehicleCount": space.vehicle_count,
                    "areaSqMeters": space.area_sq_meters,
                    "estimatedCapacity": space.estimated_capacity,
                    "sourceBlocks": space.source_block_indices,
                },
            })
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

#[derive(Serialize)]
struct CsvRow {
    id: u32,
    status: &'static str,
    confidence: f64,
    vehicle_count: u32,
    estimated_capacity: u32,
    area_sq_meters: f64,
    center_lat: f64,
    center_lng: f64,
    corner1_lat: Option<f64>,
    corner1_lng: Option<f64>,
    corner2_lat: Option<f64>,
    corner2_lng: Option<f64>,
    corner3_lat: Option<f64>,
    corner3_lng: Option<f64>,
    corner4_lat: Option<f64>,
    corner4_lng: Option<f64>,
}

impl From<&ParkingSpace> for CsvRow {
    fn from(space: &ParkingSpace) -> Self {
        let ring = open_ring(&space.geo_polygon);

        let (min_lat, max_lat, min_lng, max_lng) = ring.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
            |(min_lat, max_lat, min_lng, max_lng), p| {
                (min_lat.min(p.lat), max_lat.max(p.lat), min_lng.min(p.lng), max_lng.max(p.lng))
            },
        );

        let corner = |i: usize| ring.get(i).map(|p| (p.lat, p.lng)).unzip();

        let (corner1_lat, corner1_lng) = corner(0);
        let (corner2_lat, corner2_lng) = corner(1);
        let (corner3_lat, corner3_lng) = corner(2);
        let (corner4_lat, corner4_lng) = corner(3);

        Self {
            id: space.id,
            status: match space.status {
                SpaceStatus::Occupied => "occupied",
                SpaceStatus::Empty => "empty",
            },
            confidence: space.confidence,
            vehicle_count: space.vehicle_count,
            estimated_capacity: space.estimated_capacity,
            area_sq_meters: space.area_sq_meters,
            center_lat: (min_lat + max_lat) / 2.0,
            center_lng: (min_lng + max_lng) / 2.0,
            corner1_lat,
            corner1_lng,
            corner2_lat,
            corner2_lng,
            corner3_lat,
            corner3_lng,
            corner4_lat,
            corner4_lng,
        }
    }
}

/// One row per space with bounding box center and up to four corners.
pub fn write_csv<W: Write>(spaces: &[ParkingSpace], writer: W) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for space in spaces {
        writer.serialize(CsvRow::from(space))?;
    }

    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::GeoPoint;
    use std::collections::BTreeSet;

    fn space() -> ParkingSpace {
        let ring = vec![
            GeoPoint { lat: 52.0, lng: 5.0 },
            GeoPoint { lat: 52.0, lng: 5.0001 },
            GeoPoint { lat: 52.0001, lng: 5.0001 },
            GeoPoint { lat: 52.0001, lng: 5.0 },
            GeoPoint { lat: 52.0, lng: 5.0 },
        ];

        ParkingSpace {
            id: 1,
            status: SpaceStatus::Occupied,
            confidence: 0.8,
            vehicle_count: 2,
            estimated_capacity: 3,
            area_sq_meters: 33.75,
            dimensions_meters: (4.5, 7.5),
            centroid: GeoPoint {
                lat: 52.00005,
                lng: 5.00005,
            },
            geo_polygon: ring,
            source_block_indices: BTreeSet::from([0, 2]),
            merged_count: 2,
        }
    }

    #[test]
    fn geojson_uses_lng_lat() {
        let geojson = to_geojson(&[space()]);

        assert_eq!(geojson["type"], "FeatureCollection");

        let feature = &geojson["features"][0];

        assert_eq!(feature["geometry"]["type"], "Polygon");
        assert_eq!(feature["geometry"]["coordinates"][0][1], json!([5.0001, 52.0]));
        assert_eq!(feature["geometry"]["coordinates"][0].as_array().unwrap().len(), 5);
        assert_eq!(feature["properties"]["status"], "occupied");
        assert_eq!(feature["properties"]["vehicleCount"], 2);
        assert_eq!(feature["properties"]["sourceBlocks"], json!([0, 2]));
    }

    #[test]
    fn csv_rows() {
        let mut out = Vec::new();

        write_csv(&[space()], &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();

        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "id,status,confidence,vehicle_count,estimated_capacity,area_sq_meters,center_lat,center_lng,\
             corner1_lat,corner1_lng,corner2_lat,corner2_lng,corner3_lat,corner3_lng,corner4_lat,corner4_lng"
        );

        let row = lines.next().unwrap();

        assert!(row.starts_with("1,occupied,0.8,2,3,33.75,52.00005,5.00005,52.0,5.0,52.0,5.0001,"));
    }
}
