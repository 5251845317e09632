//! Deterministic job-to-shard placement.
//!
//! Producers and the router never coordinate: both reduce the MD5 of
//! the job id (first 8 bytes, big-endian) modulo the configured shard
//! count. The digest is part of the wire contract; non-Rust
//! producers compute the same value.

/// Shard index for a job, `0..shard_count`.
pub fn shard_for_job(job_id: &str, shard_count: u32) -> u32 {
    debug_assert!(shard_count > 0);
    let digest = md5::compute(job_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shard_count)) as u32
}

/// Sharded stream key, e.g. `scan:events:2`.
pub fn stream_key(stream_prefix: &str, job_id: &str, shard_count: u32) -> String {
    format!("{stream_prefix}:{}", shard_for_job(job_id, shard_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_pure_and_stable() {
        let job_id = "test-job-123";
        let first = shard_for_job(job_id, 4);
        for _ in 0..10 {
            assert_eq!(shard_for_job(job_id, 4), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn shards_are_distributed() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let shard = shard_for_job(&format!("job-{i}"), 4);
            assert!(shard < 4);
            seen.insert(shard);
        }
        assert!(seen.len() >= 2);
    }

    #[test]
    fn shard_respects_count() {
        let job_id = "test-job-456";
        assert!(shard_for_job(job_id, 2) < 2);
        assert!(shard_for_job(job_id, 4) < 4);
        assert!(shard_for_job(job_id, 8) < 8);
    }

    #[test]
    fn stream_key_is_consistent() {
        let a = stream_key("scan:events", "consistent-job-id", 4);
        let b = stream_key("scan:events", "consistent-job-id", 4);
        assert_eq!(a, b);
        assert!(a.starts_with("scan:events:"));
        let shard: u32 = a.rsplit(':').next().unwrap().parse().unwrap();
        assert!(shard < 4);
    }
}
