//! Body rendering: placeholder substitution from caller-supplied pools.
//!
//! Substitution draws from a deterministic per-(job, chunk, worker) stream
//! so a rerun of the same chunk produces the same messages.

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Seed for one worker's render stream.
#[must_use]
pub fn render_seed(job_id: &str, chunk_index: u32, worker_index: u32) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in job_id.bytes() {
        hash = (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3);
    }
    hash ^= u64::from(chunk_index) << 32 | u64::from(worker_index);
    hash
}

#[must_use]
pub fn rng_for(job_id: &str, chunk_index: u32, worker_index: u32) -> StdRng {
    StdRng::seed_from_u64(render_seed(job_id, chunk_index, worker_index))
}

/// Replace each `[URL]` and `[SRC]` occurrence with a draw from the
/// matching pool. Empty pools leave the placeholder in place.
#[must_use]
pub fn render_body(
    template: &str,
    url_pool: &[String],
    src_pool: &[String],
    rng: &mut StdRng,
) -> String {
    let with_urls = substitute(template, "[URL]", url_pool, rng);
    substitute(&with_urls, "[SRC]", src_pool, rng)
}

fn substitute(text: &str, placeholder: &str, pool: &[String], rng: &mut StdRng) -> String {
    if pool.is_empty() || !text.contains(placeholder) {
        return text.to_string();
    }
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find(placeholder) {
        result.push_str(&rest[..at]);
        result.push_str(&pool[rng.random_range(0..pool.len())]);
        rest = &rest[at + placeholder.len()..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> (Vec<String>, Vec<String>) {
        (
            vec![
                "https://a.example/x".to_string(),
                "https://b.example/y".to_string(),
            ],
            vec!["cdn1.example".to_string(), "cdn2.example".to_string()],
        )
    }

    #[test]
    fn test_rendering_is_deterministic_per_seed() {
        let (urls, srcs) = pools();
        let template = "Click [URL] or [URL], images at [SRC].";

        let mut rng_a = rng_for("abcdef123456", 3, 1);
        let mut rng_b = rng_for("abcdef123456", 3, 1);
        let first = render_body(template, &urls, &srcs, &mut rng_a);
        let second = render_body(template, &urls, &srcs, &mut rng_b);
        assert_eq!(first, second);
        assert!(!first.contains("[URL]"));
        assert!(!first.contains("[SRC]"));
    }

    #[test]
    fn test_distinct_workers_get_distinct_streams() {
        assert_ne!(
            render_seed("abcdef123456", 0, 0),
            render_seed("abcdef123456", 0, 1)
        );
        assert_ne!(
            render_seed("abcdef123456", 0, 0),
            render_seed("abcdef123456", 1, 0)
        );
    }

    #[test]
    fn test_empty_pool_leaves_placeholder() {
        let mut rng = rng_for("abcdef123456", 0, 0);
        let rendered = render_body("see [URL]", &[], &[], &mut rng);
        assert_eq!(rendered, "see [URL]");
    }
}
