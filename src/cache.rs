//! Two-tier cache for rendered artefacts and listings.
//!
//! L1 is a set of in-process byte-weighted LRU caches with per-class TTLs.
//! L2 is an optional shared redis instance; writes to it are fire-and-forget
//! and reads tolerate staleness because every key is content-addressed.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};

const LISTING_TTL: Duration = Duration::from_secs(60);
const METADATA_TTL: Duration = Duration::from_secs(7200);
const THUMBNAIL_TTL: Duration = Duration::from_secs(24 * 3600);

/// What kind of artefact a cache entry holds, deciding its TTL and key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    Image,
    Thumbnail,
    Listing,
    Metadata,
}

impl ArtifactClass {
    fn prefix(&self) -> &'static str {
        match self {
            ArtifactClass::Image => "img",
            ArtifactClass::Thumbnail => "thumb",
            ArtifactClass::Listing => "list",
            ArtifactClass::Metadata => "meta",
        }
    }
}

/// Where a hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    L1,
    L2,
}

#[derive(Clone)]
pub struct TieredCache {
    images: Cache<String, Arc<Vec<u8>>>,
    thumbnails: Cache<String, Arc<Vec<u8>>>,
    listings: Cache<String, Arc<Vec<u8>>>,
    metadata: Cache<String, Arc<Vec<u8>>>,
    image_ttl: Duration,
    l2: Option<redis::aio::ConnectionManager>,
}

impl TieredCache {
    /// Build the L1 tiers and, when `l2_url` is set, connect to redis.
    ///
    /// An unreachable L2 degrades to L1-only operation rather than failing
    /// startup; every later L2 interaction is equally tolerant.
    pub async fn new(l1_bytes: u64, image_ttl: Duration, l2_url: Option<&str>) -> Self {
        let l2 = match l2_url {
            Some(url) => match connect_l2(url).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(event = "cache_l2_unavailable", error = e.to_string());
                    None
                }
            },
            None => None,
        };
        Self {
            images: bytes_cache(l1_bytes / 10 * 7, image_ttl),
            thumbnails: bytes_cache(l1_bytes / 10 * 2, THUMBNAIL_TTL),
            listings: bytes_cache(l1_bytes / 20, LISTING_TTL),
            metadata: bytes_cache(l1_bytes / 20, METADATA_TTL),
            image_ttl,
            l2,
        }
    }

    pub async fn get(&self, class: ArtifactClass, key: &str) -> Option<(Arc<Vec<u8>>, CacheTier)> {
        if let Some(bytes) = self.tier(class).get(key) {
            return Some((bytes, CacheTier::L1));
        }
        // Listings are served from L1 only; their TTL is shorter than any
        // useful round-trip to the shared tier.
        if class == ArtifactClass::Listing {
            return None;
        }
        let mut conn = self.l2.clone()?;
        match conn.get::<_, Option<Vec<u8>>>(l2_key(class, key)).await {
            Ok(Some(bytes)) => {
                let bytes = Arc::new(bytes);
                self.tier(class).insert(key.to_string(), Arc::clone(&bytes));
                Some((bytes, CacheTier::L2))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(event = "cache_l2_read_failed", error = e.to_string());
                None
            }
        }
    }

    /// Insert into L1 and, for image classes, schedule a fire-and-forget L2
    /// write. L2 failures are logged and never surface.
    pub fn put(&self, class: ArtifactClass, key: &str, bytes: Arc<Vec<u8>>) {
        self.tier(class).insert(key.to_string(), Arc::clone(&bytes));
        if class == ArtifactClass::Listing {
            return;
        }
        if let Some(conn) = self.l2.clone() {
            let ttl = self.ttl(class).as_secs();
            let l2_key = l2_key(class, key);
            tokio::spawn(async move {
                let mut conn = conn;
                let outcome: redis::RedisResult<()> =
                    conn.set_ex(l2_key, bytes.as_slice(), ttl).await;
                if let Err(e) = outcome {
                    tracing::debug!(event = "cache_l2_write_failed", error = e.to_string());
                }
            });
        }
    }

    fn tier(&self, class: ArtifactClass) -> &Cache<String, Arc<Vec<u8>>> {
        match class {
            ArtifactClass::Image => &self.images,
            ArtifactClass::Thumbnail => &self.thumbnails,
            ArtifactClass::Listing => &self.listings,
            ArtifactClass::Metadata => &self.metadata,
        }
    }

    fn ttl(&self, class: ArtifactClass) -> Duration {
        match class {
            ArtifactClass::Image => self.image_ttl,
            ArtifactClass::Thumbnail => THUMBNAIL_TTL,
            ArtifactClass::Listing => LISTING_TTL,
            ArtifactClass::Metadata => METADATA_TTL,
        }
    }
}

fn bytes_cache(max_bytes: u64, ttl: Duration) -> Cache<String, Arc<Vec<u8>>> {
    Cache::builder()
        .max_capacity(max_bytes.max(1024 * 1024))
        .weigher(|key: &String, value: &Arc<Vec<u8>>| {
            (key.len() + value.len()).try_into().unwrap_or(u32::MAX)
        })
        .time_to_live(ttl)
        .build()
}

async fn connect_l2(url: &str) -> redis::RedisResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    redis::aio::ConnectionManager::new(client).await
}

fn l2_key(class: ArtifactClass, key: &str) -> String {
    format!("noctis:{}:{}", class.prefix(), key)
}

/// Content-addressed fingerprint over the given parts: hex sha256.
pub fn content_fingerprint<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
