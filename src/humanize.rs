//! Human-scaled rendering of alert counts (`8888` -> `"8.9k"`).

/// Render a count with a `k`/`M` suffix. Values under 1000 stay plain
/// integers; a thousands rendering that would round up to `1000k` is
/// promoted to `1M` instead.
pub fn compact(n: f64) -> String {
    if n < 1000.0 {
        return format!("{}", n.round() as i64);
    }
    if n < 1_000_000.0 {
        let thousands = round_tenth(n / 1000.0);
        if thousands < 1000.0 {
            return format!("{}k", trim_trailing_zero(thousands));
        }
    }
    format!("{}M", trim_trailing_zero(round_tenth(n / 1_000_000.0)))
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn trim_trailing_zero(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{:.1}", v)
    }
}
