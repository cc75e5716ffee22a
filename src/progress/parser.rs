//! Encoder progress protocol parser.
//!
//! ffmpeg started with `-progress pipe:1` writes one `key=value` group per
//! reporting tick:
//!
//! ```text
//! frame=5
//! total_size=1482
//! out_time_us=208542
//! out_time_ms=208542
//! out_time=00:00:00.208542
//! speed=0.407x
//! progress=continue
//! ```
//!
//! The final group ends with `progress=end`. Everything here is pure: a line in,
//! at most one signal out.

use super::ProgressMetric;

/// What a single progress line carries
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressSignal {
    /// Elapsed metric in the unit of the requested [`ProgressMetric`]
    Elapsed(f64),
    /// The encoder reported its final tick
    End,
}

/// Parse one line of encoder output.
///
/// Returns `None` for unknown keys, `N/A` values, malformed numbers and
/// anything that does not measure the requested metric.
pub fn parse_line(line: &str, metric: ProgressMetric) -> Option<ProgressSignal> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some((key, value)) = line.split_once('=') {
        let key = key.trim();
        let value = value.trim();

        match (key, metric) {
            ("progress", _) if value == "end" => return Some(ProgressSignal::End),
            ("progress", _) => return None,
            // ffmpeg reports microseconds under both keys
            ("out_time_us", ProgressMetric::Time) | ("out_time_ms", ProgressMetric::Time) => {
                return parse_number(value).map(|us| ProgressSignal::Elapsed(us / 1_000_000.0));
            }
            ("out_time", ProgressMetric::Time) => {
                return parse_timestamp(value).map(ProgressSignal::Elapsed);
            }
            ("total_size", ProgressMetric::Size) => {
                return parse_number(value).map(ProgressSignal::Elapsed);
            }
            _ => {}
        }
    }

    // Legacy `-stats` line: "size=     256kB time=00:00:10.00 bitrate=..."
    if metric == ProgressMetric::Size {
        return parse_stats_size(line).map(ProgressSignal::Elapsed);
    }

    None
}

fn parse_number(value: &str) -> Option<f64> {
    if value.eq_ignore_ascii_case("N/A") {
        return None;
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite() && *number >= 0.0)
}

/// `HH:MM:SS.ffffff` to seconds
fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours = parse_number(parts.next()?)?;
    let minutes = parse_number(parts.next()?)?;
    let seconds = parse_number(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extract the byte count from a `size=  123kB` token
fn parse_stats_size(line: &str) -> Option<f64> {
    let start = line.find("size=")? + "size=".len();
    let rest = line[start..].trim_start();
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let amount = rest[..digits_end].parse::<f64>().ok()?;
    let unit = rest[digits_end..]
        .split_whitespace()
        .next()
        .unwrap_or("");
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(amount * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_keys() {
        assert_eq!(
            parse_line("out_time_us=208542", ProgressMetric::Time),
            Some(ProgressSignal::Elapsed(0.208542))
        );
        assert_eq!(
            parse_line("out_time_ms=1500000\n", ProgressMetric::Time),
            Some(ProgressSignal::Elapsed(1.5))
        );
        assert_eq!(
            parse_line("out_time=01:02:03.500000", ProgressMetric::Time),
            Some(ProgressSignal::Elapsed(3723.5))
        );
    }

    #[test]
    fn test_size_keys() {
        assert_eq!(
            parse_line("total_size=1482", ProgressMetric::Size),
            Some(ProgressSignal::Elapsed(1482.0))
        );
        assert_eq!(
            parse_line("size=     256kB time=00:00:10.00 bitrate= 209.7kbits/s speed=20x", ProgressMetric::Size),
            Some(ProgressSignal::Elapsed(256.0 * 1024.0))
        );
        assert_eq!(
            parse_line("size=    2KiB time=00:00:00.10", ProgressMetric::Size),
            Some(ProgressSignal::Elapsed(2048.0))
        );
    }

    #[test]
    fn test_metric_mismatch_is_ignored() {
        assert_eq!(parse_line("total_size=1482", ProgressMetric::Time), None);
        assert_eq!(parse_line("out_time_us=1000", ProgressMetric::Size), None);
    }

    #[test]
    fn test_unusable_lines() {
        for line in [
            "",
            "   ",
            "frame=12",
            "speed=0.407x",
            "out_time_us=N/A",
            "out_time_ms=abc",
            "out_time_us=-5",
            "out_time=00:00",
            "progress=continue",
            "garbage without separator",
        ] {
            assert_eq!(parse_line(line, ProgressMetric::Time), None, "{line:?}");
        }
    }

    #[test]
    fn test_end_sentinel() {
        assert_eq!(parse_line("progress=end", ProgressMetric::Time), Some(ProgressSignal::End));
        assert_eq!(parse_line("progress=end", ProgressMetric::Size), Some(ProgressSignal::End));
    }
}
