/// Snap a requested scene duration onto the nearest value a video model accepts.
///
/// Picks the allowed member with the smallest absolute difference. When the
/// request sits exactly between two members the larger one wins, so a 7.5s
/// request against `[5, 10]` yields 10. Returns `None` only when `allowed` is
/// empty; non-finite requests fall back to the largest allowed value.
pub fn clamp_duration(requested: f64, allowed: &[u32]) -> Option<u32> {
    if !requested.is_finite() {
        return allowed.iter().copied().max();
    }

    let mut best: Option<(u32, f64)> = None;
    for &candidate in allowed {
        let diff = (f64::from(candidate) - requested).abs();
        best = match best {
            None => Some((candidate, diff)),
            Some((current, current_diff)) => {
                if diff < current_diff || (diff == current_diff && candidate > current) {
                    Some((candidate, diff))
                } else {
                    Some((current, current_diff))
                }
            }
        };
    }
    best.map(|(value, _)| value)
}
