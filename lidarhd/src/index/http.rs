//! HTTP feature-service tile index.
//!
//! Queries a remote spatial feature service for tile footprints intersecting
//! a bounding box, filtered by data type. The service speaks a GeoJSON-style
//! dialect: a `FeatureCollection` of features whose properties carry the tile
//! id and download URL.
//!
//! Two service limits shape the client:
//!
//! - large query envelopes are split into sub-envelope chunks no wider than
//!   [`IndexConfig::max_bbox_span`], and tile ids are deduplicated across
//!   chunk responses;
//! - responses are paginated; pages are walked until a short page signals the
//!   end of the result set.
//!
//! The bbox query is a coarse filter. Every candidate footprint is confirmed
//! against the exact query geometry before it is returned, so callers never
//! see tiles that merely share a bounding box with the AOI.
//!
//! The wire transport sits behind [`HttpClient`], so the chunking, pagination,
//! and retry logic is testable against scripted responses; [`ReqwestClient`]
//! is the production implementation.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DataType, IndexError, TileDescriptor, TileIndex};
use crate::geometry::{Envelope, Point, Polygon, QueryGeometry};

/// Default bbox span limit per request, in CRS units (50 km in Lambert-93).
const DEFAULT_MAX_BBOX_SPAN: f64 = 50_000.0;

/// Default page size for paginated responses.
const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Configuration for [`HttpTileIndex`].
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Feature-service endpoint serving tile footprints.
    pub base_url: String,
    /// Maximum width/height of a single bbox query, in CRS units.
    pub max_bbox_span: f64,
    /// Features requested per page.
    pub page_size: usize,
    /// Bounded retry attempts for transient failures.
    pub max_attempts: u32,
    /// Initial retry backoff; doubles per attempt.
    pub initial_backoff: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.geopf.fr/lidarhd/index".to_string(),
            max_bbox_span: DEFAULT_MAX_BBOX_SPAN,
            page_size: DEFAULT_PAGE_SIZE,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl IndexConfig {
    /// Creates a config for the given endpoint with default limits.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// A GET response as the index client sees it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Transport-level failure, pre-classified for the retry loop.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Timeout or connection failure; worth retrying.
    Transient(String),
    /// Anything else; retrying will not help.
    Permanent(String),
}

/// Minimal HTTP surface the index client needs.
///
/// Production uses [`ReqwestClient`]; tests script responses.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(request_timeout: Duration) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IndexError::Unavailable {
                attempts: 0,
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                TransportError::Transient(e.to_string())
            } else {
                TransportError::Permanent(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

/// Tile index backed by an HTTP feature service.
pub struct HttpTileIndex<C = ReqwestClient> {
    client: C,
    config: IndexConfig,
}

impl HttpTileIndex {
    /// Creates a new index client over the production transport.
    pub fn new(config: IndexConfig) -> Result<Self, IndexError> {
        let client = ReqwestClient::new(config.request_timeout)?;
        Ok(Self { client, config })
    }
}

impl<C: HttpClient> HttpTileIndex<C> {
    /// Creates an index client over a caller-supplied transport.
    pub fn with_client(client: C, config: IndexConfig) -> Self {
        Self { client, config }
    }

    /// Fetches one page, retrying transient failures with backoff.
    async fn fetch_page(
        &self,
        bbox: &Envelope,
        data_type: DataType,
        start_index: usize,
    ) -> Result<FeatureCollection, IndexError> {
        let url = self.page_url(bbox, data_type, start_index);
        let mut attempt = 0;
        let mut backoff = self.config.initial_backoff;
        loop {
            attempt += 1;
            match self.request_page(&url).await {
                Ok(body) => return parse_feature_collection(&body),
                Err(TransportError::Transient(reason))
                    if attempt < self.config.max_attempts =>
                {
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        %reason,
                        "index query failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(TransportError::Transient(reason))
                | Err(TransportError::Permanent(reason)) => {
                    return Err(IndexError::Unavailable {
                        attempts: attempt,
                        reason,
                    });
                }
            }
        }
    }

    /// Issues a single page request and classifies status-level failures.
    async fn request_page(&self, url: &str) -> Result<String, TransportError> {
        let response = self.client.get(url).await?;
        if (500..600).contains(&response.status) {
            return Err(TransportError::Transient(format!(
                "HTTP {} from index",
                response.status
            )));
        }
        if !(200..300).contains(&response.status) {
            return Err(TransportError::Permanent(format!(
                "HTTP {} from index",
                response.status
            )));
        }
        Ok(response.body)
    }

    fn page_url(&self, bbox: &Envelope, data_type: DataType, start_index: usize) -> String {
        format!(
            "{}?bbox={},{},{},{}&dataType={}&startIndex={}&count={}&outputFormat=application/json",
            self.config.base_url,
            bbox.min_x,
            bbox.min_y,
            bbox.max_x,
            bbox.max_y,
            data_type.name(),
            start_index,
            self.config.page_size
        )
    }
}

impl<C: HttpClient> TileIndex for HttpTileIndex<C> {
    async fn query(
        &self,
        geometry: &QueryGeometry,
        data_type: DataType,
    ) -> Result<Vec<TileDescriptor>, IndexError> {
        let chunks = chunk_envelope(geometry.envelope(), self.config.max_bbox_span);
        debug!(chunks = chunks.len(), %data_type, "querying tile index");

        let mut seen: HashSet<String> = HashSet::new();
        let mut tiles = Vec::new();
        let mut candidates = 0usize;

        for chunk in &chunks {
            let mut start_index = 0;
            loop {
                let page = self.fetch_page(chunk, data_type, start_index).await?;
                let page_len = page.features.len();
                for feature in page.features {
                    candidates += 1;
                    let Some(descriptor) = feature.into_descriptor(data_type) else {
                        continue;
                    };
                    if !seen.insert(descriptor.id.clone()) {
                        continue;
                    }
                    if geometry.intersects(&descriptor.footprint) {
                        tiles.push(descriptor);
                    }
                }
                if page_len < self.config.page_size {
                    break;
                }
                start_index += page_len;
            }
        }

        // Deterministic order regardless of chunk/page arrival.
        tiles.sort_by(|a, b| a.id.cmp(&b.id));
        info!(
            candidates,
            confirmed = tiles.len(),
            "tile index query complete"
        );
        Ok(tiles)
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: FeatureProperties,
    geometry: GeoJsonGeometry,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    id: String,
    url: String,
    #[serde(default)]
    size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonGeometry {
    Polygon { coordinates: Vec<Vec<[f64; 2]>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<[f64; 2]>>> },
}

impl Feature {
    /// Converts a service feature into a descriptor.
    ///
    /// Features with unusable footprints are dropped with a warning rather
    /// than failing the whole query.
    fn into_descriptor(self, data_type: DataType) -> Option<TileDescriptor> {
        let id = self.properties.id;
        let ring = match self.geometry {
            GeoJsonGeometry::Polygon { coordinates } => coordinates.into_iter().next(),
            GeoJsonGeometry::MultiPolygon { coordinates } => {
                // Tile footprints are single squares; a multi-part footprint
                // is unexpected but its first part is still the tile outline.
                coordinates.into_iter().next().and_then(|p| p.into_iter().next())
            }
        };
        let Some(ring) = ring else {
            warn!(tile_id = %id, "feature has no footprint ring, skipping");
            return None;
        };
        let points: Vec<Point> = ring.iter().map(|c| Point::new(c[0], c[1])).collect();
        match Polygon::new(points) {
            Ok(footprint) => Some(TileDescriptor {
                id,
                footprint,
                url: self.properties.url,
                data_type,
                size_bytes: self.properties.size_bytes,
            }),
            Err(e) => {
                warn!(tile_id = %id, error = %e, "feature has degenerate footprint, skipping");
                None
            }
        }
    }
}

fn parse_feature_collection(body: &str) -> Result<FeatureCollection, IndexError> {
    serde_json::from_str(body).map_err(|e| IndexError::InvalidResponse(e.to_string()))
}

/// Splits `envelope` into a grid of sub-envelopes no wider or taller than
/// `max_span`. The chunks tile the original envelope exactly.
fn chunk_envelope(envelope: &Envelope, max_span: f64) -> Vec<Envelope> {
    let cols = (envelope.width() / max_span).ceil().max(1.0) as usize;
    let rows = (envelope.height() / max_span).ceil().max(1.0) as usize;
    let col_span = envelope.width() / cols as f64;
    let row_span = envelope.height() / rows as f64;

    let mut chunks = Vec::with_capacity(cols * rows);
    for row in 0..rows {
        for col in 0..cols {
            let min_x = envelope.min_x + col as f64 * col_span;
            let min_y = envelope.min_y + row as f64 * row_span;
            chunks.push(Envelope {
                min_x,
                min_y,
                max_x: if col + 1 == cols { envelope.max_x } else { min_x + col_span },
                max_y: if row + 1 == rows { envelope.max_y } else { min_y + row_span },
            });
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted transport: responses served in order, request URLs recorded.
    #[derive(Default)]
    struct MockHttpClient {
        responses: Mutex<Vec<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        fn push_ok(&self, body: &str) {
            self.responses.lock().unwrap().push(Ok(HttpResponse {
                status: 200,
                body: body.to_string(),
            }));
        }

        fn push_status(&self, status: u16) {
            self.responses.lock().unwrap().push(Ok(HttpResponse {
                status,
                body: String::new(),
            }));
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl HttpClient for &MockHttpClient {
        async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(url.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(HttpResponse {
                    status: 200,
                    body: r#"{"features":[]}"#.to_string(),
                });
            }
            responses.remove(0)
        }
    }

    fn envelope(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// A 1 km square tile feature at the given origin, as the service
    /// would serialize it.
    fn feature_json(id: &str, min_x: f64, min_y: f64) -> String {
        format!(
            r#"{{"properties":{{"id":"{id}","url":"https://tiles.example/{id}.las"}},
                "geometry":{{"type":"Polygon","coordinates":[[
                    [{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}}}"#,
            id = id,
            x0 = min_x,
            y0 = min_y,
            x1 = min_x + 1000.0,
            y1 = min_y + 1000.0,
        )
    }

    fn collection(features: &[String]) -> String {
        format!(r#"{{"features":[{}]}}"#, features.join(","))
    }

    fn fast_config(max_bbox_span: f64, page_size: usize) -> IndexConfig {
        IndexConfig {
            base_url: "https://index.example/wfs".to_string(),
            max_bbox_span,
            page_size,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn geometry(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> QueryGeometry {
        QueryGeometry::resolve(&[Polygon::rectangle(min_x, min_y, max_x, max_y).unwrap()])
            .unwrap()
    }

    #[test]
    fn test_chunk_envelope_small_envelope_is_one_chunk() {
        let env = envelope(0.0, 0.0, 10_000.0, 10_000.0);
        let chunks = chunk_envelope(&env, 50_000.0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], env);
    }

    #[test]
    fn test_chunk_envelope_respects_span_limit() {
        let env = envelope(0.0, 0.0, 120_000.0, 70_000.0);
        let chunks = chunk_envelope(&env, 50_000.0);
        assert_eq!(chunks.len(), 3 * 2);
        for chunk in &chunks {
            assert!(chunk.width() <= 50_000.0 + 1e-6);
            assert!(chunk.height() <= 50_000.0 + 1e-6);
        }
        // Chunks cover the original envelope edge to edge.
        let max_x = chunks.iter().map(|c| c.max_x).fold(f64::MIN, f64::max);
        let max_y = chunks.iter().map(|c| c.max_y).fold(f64::MIN, f64::max);
        assert_eq!(max_x, env.max_x);
        assert_eq!(max_y, env.max_y);
    }

    #[tokio::test]
    async fn test_query_deduplicates_ids_across_chunks() {
        let client = MockHttpClient::default();
        // 8 km wide AOI with a 5 km span limit: two chunks, two requests.
        // The straddling tile comes back from both.
        let straddler = feature_json("t-straddle", 3_500.0, 0.0);
        client.push_ok(&collection(&[
            feature_json("t-west", 0.0, 0.0),
            straddler.clone(),
        ]));
        client.push_ok(&collection(&[
            straddler,
            feature_json("t-east", 7_000.0, 0.0),
        ]));

        let index = HttpTileIndex::with_client(&client, fast_config(5_000.0, 100));
        let tiles = index
            .query(&geometry(0.0, 0.0, 8_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap();

        assert_eq!(client.requests().len(), 2);
        let ids: Vec<&str> = tiles.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-east", "t-straddle", "t-west"]);
    }

    #[tokio::test]
    async fn test_query_walks_pages_until_short_page() {
        let client = MockHttpClient::default();
        // page_size 2: a full first page, then a short second page.
        client.push_ok(&collection(&[
            feature_json("t1", 0.0, 0.0),
            feature_json("t2", 1_000.0, 0.0),
        ]));
        client.push_ok(&collection(&[feature_json("t3", 2_000.0, 0.0)]));

        let index = HttpTileIndex::with_client(&client, fast_config(50_000.0, 2));
        let tiles = index
            .query(&geometry(0.0, 0.0, 3_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap();

        assert_eq!(tiles.len(), 3);
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("startIndex=0"));
        assert!(requests[1].contains("startIndex=2"));
    }

    #[tokio::test]
    async fn test_query_filters_non_intersecting_candidates() {
        let client = MockHttpClient::default();
        // The service over-answers: one tile outside the AOI entirely.
        client.push_ok(&collection(&[
            feature_json("t-in", 0.0, 0.0),
            feature_json("t-out", 50_000.0, 50_000.0),
        ]));

        let index = HttpTileIndex::with_client(&client, fast_config(50_000.0, 100));
        let tiles = index
            .query(&geometry(0.0, 0.0, 1_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap();

        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].id, "t-in");
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let client = MockHttpClient::default();
        client.push_status(503);
        client.push_status(503);
        client.push_status(503);

        let index = HttpTileIndex::with_client(&client, fast_config(50_000.0, 100));
        let error = index
            .query(&geometry(0.0, 0.0, 1_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap_err();

        assert_eq!(client.requests().len(), 3);
        assert!(matches!(
            error,
            IndexError::Unavailable { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let client = MockHttpClient::default();
        client.push_status(404);

        let index = HttpTileIndex::with_client(&client, fast_config(50_000.0, 100));
        let error = index
            .query(&geometry(0.0, 0.0, 1_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap_err();

        assert_eq!(client.requests().len(), 1);
        assert!(matches!(
            error,
            IndexError::Unavailable { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let client = MockHttpClient::default();
        client
            .responses
            .lock()
            .unwrap()
            .push(Err(TransportError::Transient("connect refused".into())));
        client.push_ok(&collection(&[feature_json("t1", 0.0, 0.0)]));

        let index = HttpTileIndex::with_client(&client, fast_config(50_000.0, 100));
        let tiles = index
            .query(&geometry(0.0, 0.0, 1_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap();

        assert_eq!(client.requests().len(), 2);
        assert_eq!(tiles.len(), 1);
    }

    #[test]
    fn test_parse_feature_collection() {
        let body = r#"{
            "type": "FeatureCollection",
            "features": [
                {
                    "properties": {
                        "id": "tile-0501-6440",
                        "url": "https://tiles.example/tile-0501-6440.las",
                        "size_bytes": 1048576
                    },
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[0.0, 0.0], [1000.0, 0.0], [1000.0, 1000.0], [0.0, 1000.0], [0.0, 0.0]]]
                    }
                }
            ]
        }"#;
        let fc = parse_feature_collection(body).unwrap();
        assert_eq!(fc.features.len(), 1);
        let descriptor = fc
            .features
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor(DataType::PointCloud)
            .unwrap();
        assert_eq!(descriptor.id, "tile-0501-6440");
        assert_eq!(descriptor.size_bytes, Some(1_048_576));
        assert!((descriptor.footprint.area() - 1_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_multipolygon_footprint_takes_first_part() {
        let body = r#"{
            "features": [
                {
                    "properties": {"id": "t1", "url": "https://tiles.example/t1.las"},
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [
                            [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]],
                            [[[5.0, 5.0], [6.0, 5.0], [6.0, 6.0], [5.0, 6.0]]]
                        ]
                    }
                }
            ]
        }"#;
        let fc = parse_feature_collection(body).unwrap();
        let descriptor = fc
            .features
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor(DataType::Dtm)
            .unwrap();
        assert_eq!(descriptor.footprint.envelope().max_x, 1.0);
    }

    #[test]
    fn test_degenerate_footprint_is_skipped() {
        let body = r#"{
            "features": [
                {
                    "properties": {"id": "bad", "url": "https://tiles.example/bad.las"},
                    "geometry": {"type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 1.0]]]}
                }
            ]
        }"#;
        let fc = parse_feature_collection(body).unwrap();
        assert!(fc
            .features
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor(DataType::PointCloud)
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let client = MockHttpClient::default();
        client.push_ok("not json");

        let index = HttpTileIndex::with_client(&client, fast_config(50_000.0, 100));
        let error = index
            .query(&geometry(0.0, 0.0, 1_000.0, 1_000.0), DataType::PointCloud)
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::InvalidResponse(_)));
    }
}
