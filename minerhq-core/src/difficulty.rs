/// Formats a difficulty for humans: `5.89K`, `2.34M`, `5.50G`.
///
/// Values below one thousand keep a single decimal.
pub fn format_difficulty(diff: f64) -> String {
    const UNITS: [(f64, &str); 3] = [(1e9, "G"), (1e6, "M"), (1e3, "K")];

    for (scale, suffix) in UNITS {
        if diff >= scale {
            return format!("{:.2}{}", diff / scale, suffix);
        }
    }

    format!("{:.1}", diff)
}
