//! Composition root wiring the SCP listener, ingest pipeline and delivery API.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use crate::api::IdsState;
use crate::cache::TieredCache;
use crate::events::IngestNotifier;
use crate::ids_server::{build_router, serve};
use crate::ingest::IngestContext;
use crate::listener_tcp_loop::dicom_listener_tcp_loop;
use crate::metadata_index::MetadataIndex;
use crate::object_store::ObjectStore;
use crate::rate_limit::RateLimiter;
use crate::scp::ScpConfig;
use crate::settings::{get_config, NoctisEnvOptions};
use crate::singleflight::Singleflight;

/// The addresses both listeners actually bound, reported through `on_start`.
#[derive(Debug, Clone, Copy)]
pub struct RunningServices {
    pub scp_addr: std::net::SocketAddr,
    pub http_addr: std::net::SocketAddr,
}

/// Calls [run_everything] using configuration from environment variables.
///
/// `finite_connections`: shut down after the given number of DICOM
/// associations (used for testing).
pub async fn run_everything_from_env(finite_connections: Option<usize>) -> anyhow::Result<()> {
    let options = get_config().extract()?;
    run_everything(options, finite_connections, None).await
}

/// Runs everything in parallel:
///
/// 1. A TCP listener accepting DICOM associations (C-STORE, C-ECHO)
/// 2. The synchronous per-instance ingest pipeline behind it
/// 3. The image delivery HTTP server
pub async fn run_everything(
    options: NoctisEnvOptions,
    finite_connections: Option<usize>,
    on_start: Option<tokio::sync::oneshot::Sender<RunningServices>>,
) -> anyhow::Result<()> {
    // Ingest and serving acquire database connections from separate pools so
    // heavy read traffic cannot starve C-STORE registrations.
    let max_conns = options.index_max_conns.get();
    let ingest_conns = (max_conns / 2).max(1);
    let serve_conns = (max_conns - ingest_conns).max(1);
    let ingest_index = MetadataIndex::connect(&options.index.url, ingest_conns).await?;
    let serve_index = MetadataIndex::connect(&options.index.url, serve_conns).await?;
    let store = Arc::new(ObjectStore::open_root(
        options.store.root.clone(),
        options.store_verify_digest_on_read,
    )?);
    let notifier = IngestNotifier::default();
    let ctx = IngestContext {
        index: ingest_index,
        store: Arc::clone(&store),
        notifier: notifier.clone(),
        aet: options.scp.aet.clone(),
    };

    let scp_listener = TcpListener::bind(("0.0.0.0", options.scp.port))?;
    let scp_addr = scp_listener.local_addr()?;
    let http_listener = tokio::net::TcpListener::bind(&options.ids.bind).await?;
    let http_addr = http_listener.local_addr()?;

    let cache = TieredCache::new(
        options.ids_cache_l1_bytes,
        Duration::from_secs(options.ids_cache_image_ttl_seconds),
        options.ids_cache_l2_url.as_deref(),
    )
    .await;
    let state = Arc::new(IdsState {
        index: serve_index,
        store,
        cache,
        flight: Singleflight::new(),
        limiter: RateLimiter::new(
            options.ids_rate_limit_requests,
            Duration::from_secs(options.ids_rate_limit_window_seconds),
        ),
        render_workers: Arc::new(tokio::sync::Semaphore::new(options.render_workers())),
        request_timeout: options.ids_request_timeout,
    });
    let router = build_router(Arc::clone(&state), &options.ids_base_path);

    if let Some(tx) = on_start {
        let _ = tx.send(RunningServices { scp_addr, http_addr });
    }

    let scp_config = ScpConfig {
        aet: options.scp.aet.clone(),
        strict: options.scp.strict,
        max_pdu_length: options.scp_max_pdu_length,
        idle_timeout: options.scp_idle_timeout,
        total_timeout: options.scp_total_timeout,
        allowed_calling_ae_titles: Arc::new(options.allowed_calling_ae_titles()),
    };
    let rt = tokio::runtime::Handle::current();
    let max_associations = options.scp_max_associations;
    let n_threads = options.scp_listener_threads.get();
    let listener_handle = tokio::task::spawn_blocking(move || {
        dicom_listener_tcp_loop(
            scp_listener,
            scp_config,
            ctx,
            rt,
            max_associations,
            n_threads,
            finite_connections,
        )
    });
    let http_handle = tokio::spawn(serve(http_listener, router));

    if finite_connections.is_some() {
        // Test mode: stop serving once the listener drained its connections.
        let result = listener_handle.await?;
        http_handle.abort();
        result
    } else {
        tokio::select! {
            r = listener_handle => r?,
            r = http_handle => r?,
        }
    }
}
