//! Pure helper functions shared by several components.
use std::time::Duration;

use rand::{thread_rng, Rng};

/// Deterministic string form of an event's identity, used as a deduplication key.
///
/// The key consists of the trimmed user id and device id followed by every `(flag key, variant
/// key)` pair sorted by flag key, so the iteration order of `results` does not matter.
pub fn canonicalize<'a>(
    user_id: Option<&str>,
    device_id: Option<&str>,
    results: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
) -> String {
    let mut results: Vec<_> = results.into_iter().collect();
    results.sort_unstable_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(&b.1)));

    let mut canonical = String::new();
    push_field(&mut canonical, user_id);
    push_field(&mut canonical, device_id);
    for (flag_key, variant_key) in results {
        push_field(&mut canonical, Some(flag_key));
        push_field(&mut canonical, variant_key);
    }
    canonical
}

fn push_field(out: &mut String, value: Option<&str>) {
    out.push_str(value.map(str::trim).unwrap_or_default());
    out.push(' ');
}

/// Stable 32-bit string hash (`s[0]*31^(n-1) + ... + s[n-1]` over UTF-16 code units).
///
/// Unlike `std`'s default hasher, the result does not change between processes or compiler
/// versions, which matters for identifiers sent to the analytics backend.
pub fn stable_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Draw a delay uniformly from `[max(0, base - jitter), base + jitter]`.
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    let low = base.saturating_sub(jitter);
    let high = base.saturating_add(jitter);
    thread_rng().gen_range(low..=high)
}
