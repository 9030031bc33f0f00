//! HTTP handlers of the image delivery service.
//!
//! Every endpoint answers JSON or PNG; failures always carry the error
//! envelope `{"error":{"kind":...,"message":...,"details":{...}}}` and never
//! a driver message or a partial body.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::cache::{content_fingerprint, ArtifactClass, TieredCache};
use crate::error::{ErrorKind, IndexError, RenderError, StoreError};
use crate::metadata_index::{IngestEvent, IngestResult, InstanceFull, MetadataIndex};
use crate::object_store::ObjectStore;
use crate::presets::{find_preset, WINDOW_PRESETS};
use crate::rate_limit::{RateLimiter, RetryAfter};
use crate::render::{render_instance, RenderParams, RenderedImage, WindowSpec};
use crate::singleflight::Singleflight;
use crate::types::{is_valid_uid, ClientAETitle, OurAETitle, SeriesUid, SopUid, StudyUid};

const THUMBNAIL_LONG_EDGE: u32 = 256;

static X_CACHE: HeaderName = HeaderName::from_static("x-cache");
static X_IMAGE_KEY: HeaderName = HeaderName::from_static("x-image-key");
static X_IMAGE_METADATA: HeaderName = HeaderName::from_static("x-image-metadata");

/// Shared state of the delivery service.
pub struct IdsState {
    pub index: MetadataIndex,
    pub store: Arc<ObjectStore>,
    pub cache: TieredCache,
    pub flight: Singleflight<Arc<RenderedImage>>,
    pub limiter: RateLimiter,
    pub render_workers: Arc<tokio::sync::Semaphore>,
    pub request_timeout: Duration,
}

pub type SharedState = Arc<IdsState>;

/// An error ready to be rendered as the JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: serde_json::Value,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: json!({}),
            retry_after: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "request deadline exceeded")
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "kind": self.kind.as_str(),
                "message": self.message,
                "details": self.details,
            }
        });
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        match &e {
            IndexError::NotFound { entity, uid } => Self::new(e.kind(), format!("{e}"))
                .with_details(json!({ "entity": entity, "uid": uid })),
            _ => Self::new(e.kind(), e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        // A resolvable instance whose file is gone or altered is a corrupt
        // artifact, whatever the store reports.
        Self::new(ErrorKind::CorruptArtifact, e.to_string())
    }
}

impl From<RenderError> for ApiError {
    fn from(e: RenderError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// `GET /studies/{studyUid}/series`
pub async fn list_series(
    State(state): State<SharedState>,
    Path(study_uid): Path<String>,
) -> Result<Response, ApiError> {
    let study_uid = parse_uid(&study_uid).map(StudyUid::from)?;
    let key = content_fingerprint(["series-listing", study_uid.as_str()]);
    if let Some((bytes, _)) = state.cache.get(ArtifactClass::Listing, &key).await {
        return Ok(json_bytes_response(bytes, true));
    }
    let series = state.index.list_series(&study_uid).await?;
    let bytes = Arc::new(serde_json::to_vec(&json!({ "series": series })).unwrap_or_default());
    state
        .cache
        .put(ArtifactClass::Listing, &key, Arc::clone(&bytes));
    Ok(json_bytes_response(bytes, false))
}

/// `GET /series/{seriesUid}/images`
pub async fn list_images(
    State(state): State<SharedState>,
    Path(series_uid): Path<String>,
) -> Result<Response, ApiError> {
    let series_uid = parse_uid(&series_uid).map(SeriesUid::from)?;
    let key = content_fingerprint(["image-listing", series_uid.as_str()]);
    if let Some((bytes, _)) = state.cache.get(ArtifactClass::Listing, &key).await {
        return Ok(json_bytes_response(bytes, true));
    }
    let images = state.index.list_instances(&series_uid).await?;
    let bytes = Arc::new(serde_json::to_vec(&json!({ "images": images })).unwrap_or_default());
    state
        .cache
        .put(ArtifactClass::Listing, &key, Arc::clone(&bytes));
    Ok(json_bytes_response(bytes, false))
}

/// `GET /presets`
pub async fn list_presets() -> Response {
    axum::Json(json!({ "presets": WINDOW_PRESETS })).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    preset: Option<String>,
    ww: Option<f64>,
    wl: Option<f64>,
    invert: Option<bool>,
    format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Png,
    Json,
}

impl ImageQuery {
    /// Effective window resolution order: explicit `ww`/`wl` beat a named
    /// preset; both beat the instance defaults (handled by the renderer).
    fn window(&self) -> Result<Option<WindowSpec>, ApiError> {
        match (self.ww, self.wl) {
            (Some(ww), Some(wl)) => {
                if !ww.is_finite() || !wl.is_finite() || ww < 1.0 {
                    return Err(ApiError::bad_request("ww must be a number >= 1"));
                }
                Ok(Some(WindowSpec { center: wl, width: ww }))
            }
            (None, None) => match &self.preset {
                Some(name) => match find_preset(name) {
                    Some(preset) => Ok(Some(WindowSpec {
                        center: preset.window_center,
                        width: preset.window_width,
                    })),
                    None => Err(ApiError::bad_request(format!("unknown preset \"{name}\""))
                        .with_details(json!({ "preset": name }))),
                },
                None => Ok(None),
            },
            _ => Err(ApiError::bad_request("ww and wl must be given together")),
        }
    }

    fn format(&self) -> Result<ImageFormat, ApiError> {
        match self.format.as_deref() {
            None | Some("png") => Ok(ImageFormat::Png),
            Some("json") => Ok(ImageFormat::Json),
            Some(other) => {
                Err(ApiError::bad_request(format!("unsupported format \"{other}\"")))
            }
        }
    }
}

/// `GET /images/{instanceUid}`
pub async fn get_image(
    State(state): State<SharedState>,
    Path(sop_uid): Path<String>,
    Query(query): Query<ImageQuery>,
) -> Result<Response, ApiError> {
    let sop_uid = parse_uid(&sop_uid).map(SopUid::from)?;
    let window = query.window()?;
    let format = query.format()?;
    let invert = query.invert.unwrap_or(false);

    let meta = state.index.get_instance(&sop_uid).await?;
    let params = RenderParams {
        window,
        invert,
        long_edge: None,
    };
    let key = image_key(&meta, &params, "full");
    let served = tokio::time::timeout(
        state.request_timeout,
        serve_rendered(&state, ArtifactClass::Image, &key, &meta, params),
    )
    .await
    .map_err(|_| ApiError::timeout())??;

    Ok(match format {
        ImageFormat::Png => png_response(&state, served, &meta, &key),
        ImageFormat::Json => json_image_response(served, &meta, &key),
    })
}

/// `GET /images/{instanceUid}/thumbnail`
pub async fn get_thumbnail(
    State(state): State<SharedState>,
    Path(sop_uid): Path<String>,
) -> Result<Response, ApiError> {
    let sop_uid = parse_uid(&sop_uid).map(SopUid::from)?;
    let meta = state.index.get_instance(&sop_uid).await?;
    let params = RenderParams {
        window: None,
        invert: false,
        long_edge: Some(THUMBNAIL_LONG_EDGE),
    };
    let key = image_key(&meta, &params, "256");
    let served = tokio::time::timeout(
        state.request_timeout,
        serve_rendered(&state, ArtifactClass::Thumbnail, &key, &meta, params),
    )
    .await
    .map_err(|_| ApiError::timeout())??;
    Ok(png_response(&state, served, &meta, &key))
}

/// `GET /images/{instanceUid}/metadata`
pub async fn get_image_metadata(
    State(state): State<SharedState>,
    Path(sop_uid): Path<String>,
) -> Result<Response, ApiError> {
    let sop_uid = parse_uid(&sop_uid).map(SopUid::from)?;
    let key = content_fingerprint(["instance-metadata", sop_uid.as_str()]);
    if let Some((bytes, _)) = state.cache.get(ArtifactClass::Metadata, &key).await {
        return Ok(json_bytes_response(bytes, true));
    }
    let meta = state.index.get_instance(&sop_uid).await?;
    let bytes = Arc::new(serde_json::to_vec(&instance_metadata_json(&meta)).unwrap_or_default());
    state
        .cache
        .put(ArtifactClass::Metadata, &key, Arc::clone(&bytes));
    Ok(json_bytes_response(bytes, false))
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    since: Option<String>,
    limit: Option<i64>,
}

/// `GET /events`, the poll side of the ingest-event subscription.
pub async fn list_events(
    State(state): State<SharedState>,
    Query(query): Query<EventQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = state
        .index
        .list_events(query.since.as_deref(), limit)
        .await?;
    Ok(axum::Json(json!({ "events": events })).into_response())
}

/// `GET /healthz`
pub async fn healthz(State(state): State<SharedState>) -> Response {
    let index_ok = state.index.is_reachable().await;
    let status = if index_ok { "ok" } else { "degraded" };
    let body = axum::Json(json!({ "status": status, "index": index_ok }));
    if index_ok {
        body.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

/// Per-caller token bucket, keyed by the reverse proxy's caller identifier.
pub async fn rate_limit(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_id(request.headers());
    match state.limiter.try_acquire(&caller) {
        Ok(()) => next.run(request).await,
        Err(RetryAfter(secs)) => {
            let mut err = ApiError::new(ErrorKind::RateLimited, "request budget exhausted")
                .with_details(json!({ "caller": caller }));
            err.retry_after = Some(secs);
            err.into_response()
        }
    }
}

fn caller_id(headers: &HeaderMap) -> String {
    if let Some(user) = headers.get("x-forwarded-user").and_then(|v| v.to_str().ok()) {
        if !user.is_empty() {
            return user.to_string();
        }
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// What a render request resolved to: PNG bytes plus where they came from.
struct ServedImage {
    png: Arc<Vec<u8>>,
    cache_hit: bool,
}

/// The content-addressed cache key of a render.
fn image_key(meta: &InstanceFull, params: &RenderParams, long_edge: &str) -> String {
    let window_part = match params.window {
        Some(w) => format!("w:{}/{}", w.width, w.center),
        None => "auto".to_string(),
    };
    let invert_part = if params.invert { "inverted" } else { "plain" };
    content_fingerprint([
        meta.sha256.as_str(),
        window_part.as_str(),
        invert_part,
        "png",
        long_edge,
    ])
}

/// Serve from cache or render exactly once per key.
async fn serve_rendered(
    state: &SharedState,
    class: ArtifactClass,
    key: &str,
    meta: &InstanceFull,
    params: RenderParams,
) -> Result<ServedImage, ApiError> {
    if let Some((png, _tier)) = state.cache.get(class, key).await {
        return Ok(ServedImage {
            png,
            cache_hit: true,
        });
    }

    let rendered = state
        .flight
        .run(key, || render_and_cache(state, class, key, meta, params))
        .await;
    let rendered = match rendered {
        Ok(rendered) => rendered,
        Err(e) => {
            if e.kind() == ErrorKind::CorruptArtifact {
                annotate_corrupt_artifact(state, meta).await;
            }
            return Err(e);
        }
    };
    Ok(ServedImage {
        png: Arc::new(rendered.png.clone()),
        cache_hit: false,
    })
}

async fn render_and_cache(
    state: &SharedState,
    class: ArtifactClass,
    key: &str,
    meta: &InstanceFull,
    params: RenderParams,
) -> Result<Arc<RenderedImage>, ApiError> {
    let _permit = state
        .render_workers
        .acquire()
        .await
        .map_err(|_| ApiError::new(ErrorKind::Unavailable, "render pool closed"))?;
    let store = Arc::clone(&state.store);
    let meta = meta.clone();
    let rendered = tokio::task::spawn_blocking(move || {
        let bytes = if store.verify_digest_on_read() {
            store.read_verified(&meta.storage_key, &meta.sha256)?
        } else {
            store.read(&meta.storage_key)?
        };
        render_instance(&bytes, &meta, &params).map_err(ApiError::from)
    })
    .await
    .map_err(|e| ApiError::new(ErrorKind::ProcessingFailure, e.to_string()))??;

    let rendered = Arc::new(rendered);
    state
        .cache
        .put(class, key, Arc::new(rendered.png.clone()));
    Ok(rendered)
}

/// Annotate the ingest log when a stored file turns out missing or altered.
/// The instance row itself stays.
async fn annotate_corrupt_artifact(state: &SharedState, meta: &InstanceFull) {
    let evt = IngestEvent {
        calling_aet: ClientAETitle::from("IDS"),
        called_aet: OurAETitle::from("IDS"),
        peer_addr: None,
        result: IngestResult::Rejected,
        reject_reason: Some("corrupt_artifact".to_string()),
        sop_uid: Some(meta.sop_uid.clone()),
    };
    if let Err(e) = state.index.record_event(&evt).await {
        tracing::error!(event = "corrupt_annotation_failed", error = e.to_string());
    }
    tracing::error!(
        event = "corrupt_artifact",
        sop_uid = meta.sop_uid.as_str(),
        storage_key = meta.storage_key.as_str(),
    );
}

fn parse_uid(raw: &str) -> Result<&str, ApiError> {
    if is_valid_uid(raw) {
        Ok(raw)
    } else {
        Err(ApiError::bad_request("malformed DICOM UID").with_details(json!({ "uid": raw })))
    }
}

fn json_bytes_response(bytes: Arc<Vec<u8>>, cache_hit: bool) -> Response {
    let mut response = Response::new(axum::body::Body::from(bytes.as_ref().clone()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(X_CACHE.clone(), cache_header(cache_hit));
    response
}

fn png_response(
    _state: &SharedState,
    served: ServedImage,
    meta: &InstanceFull,
    key: &str,
) -> Response {
    let mut response = Response::new(axum::body::Body::from(served.png.as_ref().clone()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=60"),
    );
    headers.insert(X_CACHE.clone(), cache_header(served.cache_hit));
    if let Ok(value) = HeaderValue::from_str(&key[..16]) {
        headers.insert(X_IMAGE_KEY.clone(), value);
    }
    if let Ok(value) =
        HeaderValue::from_str(&instance_metadata_json(meta).to_string())
    {
        headers.insert(X_IMAGE_METADATA.clone(), value);
    }
    response
}

fn json_image_response(served: ServedImage, meta: &InstanceFull, key: &str) -> Response {
    let data_url = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(served.png.as_slice())
    );
    let body = json!({
        "dataUrl": data_url,
        "metadata": instance_metadata_json(meta),
        "cacheHit": served.cache_hit,
    });
    let mut response = axum::Json(body).into_response();
    let headers = response.headers_mut();
    headers.insert(X_CACHE.clone(), cache_header(served.cache_hit));
    if let Ok(value) = HeaderValue::from_str(&key[..16]) {
        headers.insert(X_IMAGE_KEY.clone(), value);
    }
    response
}

fn cache_header(hit: bool) -> HeaderValue {
    if hit {
        HeaderValue::from_static("hit")
    } else {
        HeaderValue::from_static("miss")
    }
}

fn instance_metadata_json(meta: &InstanceFull) -> serde_json::Value {
    json!({
        "instanceUid": meta.sop_uid,
        "seriesUid": meta.series_uid,
        "sopClassUid": meta.sop_class_uid,
        "number": meta.instance_number,
        "rows": meta.rows,
        "cols": meta.columns,
        "modality": meta.modality,
        "bitsAllocated": meta.bits_allocated,
        "photometric": meta.photometric,
        "defaultWindowCenter": meta.window_center,
        "defaultWindowWidth": meta.window_width,
        "rescaleSlope": meta.rescale_slope,
        "rescaleIntercept": meta.rescale_intercept,
        "fileSize": meta.file_size,
        "sha256": meta.sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(None, None, None, Ok(None))]
    #[case(Some(400.0), Some(40.0), None, Ok(Some(WindowSpec { center: 40.0, width: 400.0 })))]
    #[case(Some(100.0), Some(50.0), Some("bone"), Ok(Some(WindowSpec { center: 50.0, width: 100.0 })))]
    #[case(None, None, Some("lung"), Ok(Some(WindowSpec { center: -600.0, width: 1500.0 })))]
    fn test_window_resolution(
        #[case] ww: Option<f64>,
        #[case] wl: Option<f64>,
        #[case] preset: Option<&str>,
        #[case] expected: Result<Option<WindowSpec>, ()>,
    ) {
        let query = ImageQuery {
            preset: preset.map(str::to_string),
            ww,
            wl,
            ..Default::default()
        };
        assert_eq!(query.window().map_err(|_| ()), expected);
    }

    #[rstest]
    #[case(Some(0.0), Some(40.0))]
    #[case(Some(-5.0), Some(40.0))]
    #[case(Some(400.0), None)]
    #[case(None, Some(40.0))]
    fn test_invalid_window_is_bad_request(#[case] ww: Option<f64>, #[case] wl: Option<f64>) {
        let query = ImageQuery {
            ww,
            wl,
            ..Default::default()
        };
        let err = query.window().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_unknown_preset_is_bad_request() {
        let query = ImageQuery {
            preset: Some("sepia".into()),
            ..Default::default()
        };
        assert_eq!(query.window().unwrap_err().kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_caller_id_prefers_forwarded_user() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static("dr-jones"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        assert_eq!(caller_id(&headers), "dr-jones");

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 172.16.0.1"),
        );
        assert_eq!(caller_id(&headers), "10.0.0.1");

        assert_eq!(caller_id(&HeaderMap::new()), "anonymous");
    }

    #[test]
    fn test_preset_and_explicit_window_share_a_cache_key() {
        let meta = test_meta();
        let explicit = RenderParams {
            window: Some(WindowSpec { center: -600.0, width: 1500.0 }),
            invert: false,
            long_edge: None,
        };
        // The preset path resolves to the same effective window first.
        let preset = RenderParams {
            window: Some(WindowSpec { center: -600.0, width: 1500.0 }),
            invert: false,
            long_edge: None,
        };
        assert_eq!(
            image_key(&meta, &explicit, "full"),
            image_key(&meta, &preset, "full")
        );
        let auto = RenderParams {
            window: None,
            invert: false,
            long_edge: None,
        };
        assert_ne!(
            image_key(&meta, &explicit, "full"),
            image_key(&meta, &auto, "full")
        );
    }

    fn test_meta() -> InstanceFull {
        InstanceFull {
            sop_uid: SopUid::from("1.2.840.1"),
            series_uid: SeriesUid::from("1.2.840.1.series"),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            instance_number: Some(1),
            rows: 16,
            columns: 16,
            bits_allocated: Some(16),
            pixel_representation: Some(1),
            photometric: Some("MONOCHROME2".into()),
            window_center: Some(40.0),
            window_width: Some(400.0),
            rescale_slope: Some(1.0),
            rescale_intercept: Some(0.0),
            modality: Some("CT".into()),
            storage_key: crate::types::StorageKey::from("aa/x.dcm"),
            file_size: 1,
            sha256: "cafe".into(),
        }
    }
}
