//! Host resolution with stable per-host ids.
//!
//! The connection cache indexes its per-host buckets by a small integer,
//! so every distinct `host:port` target gets a process-lifetime
//! [`ResolvedHost`] with a monotonically assigned id. Resolution itself is
//! a thin seam over the runtime's resolver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::Error;

/// A resolved target, stable for the process lifetime.
#[derive(Debug)]
pub struct ResolvedHost {
    /// Monotonic id; indexes the cache's per-host bucket table.
    pub id: u32,
    /// Original host string.
    pub host: String,
    pub port: u16,
    /// Resolved addresses in resolver order.
    pub addrs: Vec<SocketAddr>,
}

fn cache() -> &'static Mutex<HashMap<(String, u16), Arc<ResolvedHost>>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, u16), Arc<ResolvedHost>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Resolve `host:port`, reusing the cached entry (and its id) if present.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Arc<ResolvedHost>, Error> {
    let key = (host.to_owned(), port);

    if let Some(found) = cache().lock().get(&key) {
        return Ok(found.clone());
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(Error::msg(format!("can not resolve {host}")))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::message(format!("can not resolve {host}")));
    }

    let mut guard = cache().lock();
    // A concurrent resolve may have won; its id must stay stable.
    if let Some(found) = guard.get(&key) {
        return Ok(found.clone());
    }

    let resolved = Arc::new(ResolvedHost {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        host: host.to_owned(),
        port,
        addrs,
    });
    guard.insert(key, resolved.clone());
    Ok(resolved)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ids_are_stable_per_target() {
        let first = resolve("127.0.0.1", 19001).await.unwrap();
        let again = resolve("127.0.0.1", 19001).await.unwrap();
        let other = resolve("127.0.0.1", 19002).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.addrs, again.addrs);
        assert!(!first.addrs.is_empty());
    }
}
