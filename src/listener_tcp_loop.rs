//! Listen for incoming DICOM associations on a TCP port.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ingest::IngestContext;
use crate::scp::{handle_association, reject_over_capacity, ScpConfig};
use crate::thread_pool::ThreadPool;

/// Accept associations until the listener closes.
///
/// Every TCP connection is handled by [handle_association] on a pool thread.
/// Connections beyond `max_associations` concurrently open ones receive an
/// Association Reject instead of queueing.
///
/// `finite_connections` is only used for testing: it tells the server to exit
/// after a given number of connections.
pub fn dicom_listener_tcp_loop(
    listener: TcpListener,
    config: ScpConfig,
    ctx: IngestContext,
    rt: tokio::runtime::Handle,
    max_associations: usize,
    n_threads: usize,
    finite_connections: Option<usize>,
) -> anyhow::Result<()> {
    tracing::info!(
        event = "scp_listening",
        address = listener.local_addr()?.to_string(),
        aet = config.aet.as_str(),
    );
    let mut pool = ThreadPool::new(n_threads, "dicom_listener");
    let config = Arc::new(config);
    let ctx = Arc::new(ctx);
    let active = Arc::new(AtomicUsize::new(0));

    let incoming: Box<dyn Iterator<Item = Result<std::net::TcpStream, _>>> =
        if let Some(n) = finite_connections {
            Box::new(listener.incoming().take(n))
        } else {
            Box::new(listener.incoming())
        };
    for stream in incoming {
        match stream {
            Ok(scu_stream) => {
                let config = Arc::clone(&config);
                let ctx = Arc::clone(&ctx);
                let active = Arc::clone(&active);
                let rt = rt.clone();
                let max = max_associations;
                pool.execute(move || {
                    let ulid = ulid::Ulid::new();
                    let span = tracing::info_span!("association", id = ulid.to_string());
                    let _guard = span.enter();
                    let slot = AssociationSlot::try_acquire(active, max);
                    match slot {
                        Some(_slot) => {
                            if let Err(e) = handle_association(scu_stream, &config, &ctx, &rt) {
                                tracing::error!(event = "association_failed", error = e.to_string());
                            }
                        }
                        None => {
                            tracing::warn!(event = "association_over_capacity");
                            reject_over_capacity(scu_stream, &config);
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!(event = "accept_failed", error = e.to_string());
            }
        }
    }
    pool.shutdown();
    Ok(())
}

/// A claim on one of the bounded association slots, released on drop.
struct AssociationSlot {
    active: Arc<AtomicUsize>,
}

impl AssociationSlot {
    fn try_acquire(active: Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let claimed = active.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n < max {
                Some(n + 1)
            } else {
                None
            }
        });
        claimed.ok().map(|_| Self { active })
    }
}

impl Drop for AssociationSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
