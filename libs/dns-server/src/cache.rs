use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use dns_types::RecordType;

use crate::Resolution;

const CACHE_SIZE: usize = 1024;

/// Positive and negative answer cache, keyed by `(name, qtype)`.
///
/// Bounded with LRU eviction; entries also expire by TTL.
pub(crate) struct Cache {
    inner: lru::LruCache<(String, RecordType), Entry>,
}

struct Entry {
    answer: CachedAnswer,
    expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CachedAnswer {
    Ips(Vec<IpAddr>),
    NxDomain,
}

impl CachedAnswer {
    pub(crate) fn to_resolution(&self, name: &str, ttl: Duration) -> Resolution {
        match self {
            CachedAnswer::Ips(ips) => {
                Resolution::Records(crate::ip_records(name, ips.iter().copied(), ttl))
            }
            CachedAnswer::NxDomain => Resolution::NxDomain,
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            inner: lru::LruCache::new(NonZeroUsize::new(CACHE_SIZE).expect("cache size is nonzero")),
        }
    }
}

impl Cache {
    pub(crate) fn get(&mut self, name: &str, qtype: RecordType, now: Instant) -> Option<CachedAnswer> {
        let key = (name.to_owned(), qtype);

        let entry = self.inner.get(&key)?;

        if entry.expires_at <= now {
            self.inner.pop(&key);

            return None;
        }

        Some(entry.answer.clone())
    }

    pub(crate) fn insert(
        &mut self,
        name: &str,
        qtype: RecordType,
        answer: CachedAnswer,
        expires_at: Instant,
    ) {
        self.inner
            .put((name.to_owned(), qtype), Entry { answer, expires_at });
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_not_returned() {
        let mut cache = Cache::default();
        let now = Instant::now();

        cache.insert(
            "foo.svc.",
            RecordType::A,
            CachedAnswer::NxDomain,
            now + Duration::from_secs(4),
        );

        assert_eq!(
            cache.get("foo.svc.", RecordType::A, now),
            Some(CachedAnswer::NxDomain)
        );
        assert_eq!(
            cache.get("foo.svc.", RecordType::A, now + Duration::from_secs(5)),
            None
        );
    }

    #[test]
    fn qtype_is_part_of_the_key() {
        let mut cache = Cache::default();
        let now = Instant::now();

        cache.insert(
            "foo.svc.",
            RecordType::A,
            CachedAnswer::Ips(vec!["10.96.0.1".parse().unwrap()]),
            now + Duration::from_secs(4),
        );

        assert_eq!(cache.get("foo.svc.", RecordType::AAAA, now), None);
    }
}
