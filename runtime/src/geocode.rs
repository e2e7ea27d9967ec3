//! City geocoding and map-grid subdivision for the browser strategy.

use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::HttpRequest;
use crate::error::FetchError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Upper bound on grid cells per city.
const MAX_CELLS: usize = 400;
const KM_PER_DEGREE_LAT: f64 = 111.0;

/// Geographic bounding box in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        ((self.south + self.north) / 2.0, (self.west + self.east) / 2.0)
    }

    /// Centers of square cells of roughly `cell_km` covering the box, row by
    /// row from the south-west corner. The cell size grows when the box
    /// would need more than a few hundred cells.
    pub fn grid_cells(&self, cell_km: f64) -> Vec<(f64, f64)> {
        let (center_lat, _) = self.center();
        let height = (self.north - self.south).abs();
        let width = (self.east - self.west).abs();
        let mut cell_km = if cell_km > 0.0 { cell_km } else { 2.0 };

        loop {
            let lat_step = cell_km / KM_PER_DEGREE_LAT;
            let km_per_degree_lng = KM_PER_DEGREE_LAT * center_lat.to_radians().cos().max(0.01);
            let lng_step = cell_km / km_per_degree_lng;
            let rows = ((height / lat_step).ceil() as usize).max(1);
            let cols = ((width / lng_step).ceil() as usize).max(1);
            if rows * cols > MAX_CELLS {
                cell_km *= 1.5;
                continue;
            }
            let (top, right) = (self.north.max(self.south), self.east.max(self.west));
            let mut cells = Vec::with_capacity(rows * cols);
            for r in 0..rows {
                for c in 0..cols {
                    let lat = (self.south + lat_step * (r as f64 + 0.5)).min(top);
                    let lng = (self.west + lng_step * (c as f64 + 0.5)).min(right);
                    cells.push((lat, lng));
                }
            }
            return cells;
        }
    }
}

/// Resolves a place name to its bounding box.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn locate(
        &self,
        ctx: &mut FetchContext,
        place: &str,
    ) -> Result<Option<BoundingBox>, FetchError>;
}

/// Nominatim search client. Requests go through the job's paced path.
pub struct NominatimGeocoder {
    url: String,
}

impl NominatimGeocoder {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Parse the first hit of a Nominatim `format=json` answer. Its
/// `boundingbox` is `[south, north, west, east]` as strings.
pub fn parse_nominatim(body: &str) -> Option<BoundingBox> {
    let value: Value = serde_json::from_str(body).ok()?;
    let bbox = value.as_array()?.first()?.get("boundingbox")?.as_array()?;
    let num = |i: usize| -> Option<f64> {
        match bbox.get(i)? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    Some(BoundingBox {
        south: num(0)?,
        north: num(1)?,
        west: num(2)?,
        east: num(3)?,
    })
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn locate(
        &self,
        ctx: &mut FetchContext,
        place: &str,
    ) -> Result<Option<BoundingBox>, FetchError> {
        let request = HttpRequest::get(&self.url).with_query(vec![
            ("q".into(), place.to_string()),
            ("format".into(), "json".into()),
            ("limit".into(), "1".into()),
        ]);
        let resp = ctx.send(request).await?;
        if !resp.is_success() {
            tracing::debug!("geocoder answered {} for {place}", resp.status);
            return Ok(None);
        }
        Ok(parse_nominatim(&resp.body))
    }
}

/// Process-wide memo in front of another geocoder.
pub struct CachedGeocoder<G> {
    inner: G,
    cache: Mutex<HashMap<String, Option<BoundingBox>>>,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    async fn locate(
        &self,
        ctx: &mut FetchContext,
        place: &str,
    ) -> Result<Option<BoundingBox>, FetchError> {
        let key = crate::normalize::text::fold(place);
        if let Some(hit) = self.cache.lock().await.get(&key) {
            return Ok(*hit);
        }
        let found = self.inner.locate(ctx, place).await?;
        self.cache.lock().await.insert(key, found);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::fetch::testing::{context, ScriptedTransport};
    use std::sync::Arc;

    const LYON: &str = r#"[{"boundingbox": ["45.7073666", "45.8082628", "4.7718134", "4.8983774"],
        "lat": "45.7578137", "lon": "4.8320114"}]"#;

    #[test]
    fn test_parse_nominatim() {
        let bbox = parse_nominatim(LYON).unwrap();
        assert!((bbox.south - 45.7073666).abs() < 1e-9);
        assert!((bbox.east - 4.8983774).abs() < 1e-9);
        assert!(parse_nominatim("[]").is_none());
    }

    #[test]
    fn test_grid_covers_box() {
        let bbox = parse_nominatim(LYON).unwrap();
        let cells = bbox.grid_cells(2.0);
        // ~11 km tall and ~10 km wide.
        assert!(cells.len() >= 20 && cells.len() <= 42, "{}", cells.len());
        for (lat, lng) in &cells {
            assert!(*lat >= bbox.south && *lat <= bbox.north);
            assert!(*lng >= bbox.west && *lng <= bbox.east);
        }
    }

    #[test]
    fn test_grid_is_capped() {
        let bbox = BoundingBox {
            south: 40.0,
            north: 41.0,
            west: -74.5,
            east: -73.0,
        };
        assert!(bbox.grid_cells(0.5).len() <= MAX_CELLS);
    }

    #[test]
    fn test_tiny_box_is_one_cell() {
        let bbox = BoundingBox {
            south: 48.85,
            north: 48.851,
            west: 2.35,
            east: 2.351,
        };
        assert_eq!(bbox.grid_cells(2.0).len(), 1);
    }

    #[tokio::test]
    async fn test_cache_avoids_second_lookup() {
        let transport = Arc::new(ScriptedTransport::new(vec![Some((200, LYON))]));
        let mut ctx = context(Arc::clone(&transport));
        let geocoder = CachedGeocoder::new(NominatimGeocoder::new("https://geo.test/search"));
        let first = geocoder.locate(&mut ctx, "Lyon").await.unwrap();
        let second = geocoder.locate(&mut ctx, "LYON").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }
}
