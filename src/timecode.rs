use crate::{EngineError, Result};
use regex::Regex;
use std::sync::OnceLock;

pub const START_NEGATIVE: &str = "clip start must be zero or greater";
pub const END_NOT_POSITIVE: &str = "clip end must be greater than zero";
pub const END_NOT_AFTER_START: &str = "clip end must be greater than clip start";

static TIMECODE_RE: OnceLock<Regex> = OnceLock::new();

fn timecode_re() -> &'static Regex {
    TIMECODE_RE.get_or_init(|| {
        Regex::new(r"^(-)?(?:(\d+):)?(?:(\d+):)?(\d+(?:\.\d+)?|\.\d+)$").unwrap()
    })
}

/// Parses `SS(.ms)`, `MM:SS(.ms)` or `H:MM:SS(.ms)` into seconds.
///
/// Blank input is `Ok(None)`. A leading `-` is accepted so that range
/// validation, not parsing, reports negative offsets.
pub fn parse_timecode(text: &str) -> Result<Option<f64>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let invalid = || EngineError::Validation(format!("invalid time value: {trimmed}"));
    let caps = timecode_re().captures(trimmed).ok_or_else(invalid)?;
    let negative = caps.get(1).is_some();

    // With two colons the groups are (hours, minutes); with one colon the
    // single group is minutes.
    let (hours, minutes) = match (caps.get(2), caps.get(3)) {
        (Some(h), Some(m)) => (h.as_str(), m.as_str()),
        (Some(m), None) => ("0", m.as_str()),
        _ => ("0", "0"),
    };
    let hours: f64 = hours.parse().map_err(|_| invalid())?;
    let minutes: f64 = minutes.parse().map_err(|_| invalid())?;
    let seconds: f64 = caps[4].parse().map_err(|_| invalid())?;

    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    if !total.is_finite() {
        return Err(invalid());
    }
    Ok(Some(if negative { -total } else { total }))
}

/// Decimal seconds for ffmpeg: at most three decimals, trailing zeros dropped.
pub fn format_seconds(seconds: f64) -> String {
    let text = format!("{seconds:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl ClipRange {
    pub fn new(start: Option<f64>, end: Option<f64>) -> Result<Self> {
        let problems = Self::validate_all(start, end);
        if !problems.is_empty() {
            return Err(EngineError::Validation(problems.join("; ")));
        }
        Ok(Self { start, end })
    }

    /// Every violated bound rule, in a stable order.
    pub fn validate_all(start: Option<f64>, end: Option<f64>) -> Vec<&'static str> {
        let mut problems = Vec::new();
        if matches!(start, Some(s) if s < 0.0) {
            problems.push(START_NEGATIVE);
        }
        if matches!(end, Some(e) if e <= 0.0) {
            problems.push(END_NOT_POSITIVE);
        }
        if let (Some(s), Some(e)) = (start, end) {
            if e <= s {
                problems.push(END_NOT_AFTER_START);
            }
        }
        problems
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn start_arg(&self) -> Option<String> {
        self.start.map(format_seconds)
    }

    pub fn end_arg(&self) -> Option<String> {
        self.end.map(format_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_colon_forms() {
        assert_eq!(parse_timecode("").expect("blank"), None);
        assert_eq!(parse_timecode("  ").expect("blank"), None);
        assert_eq!(parse_timecode("90").expect("secs"), Some(90.0));
        assert_eq!(parse_timecode("12.5").expect("secs"), Some(12.5));
        assert_eq!(parse_timecode("1:02").expect("mm:ss"), Some(62.0));
        assert_eq!(parse_timecode("1:02:03").expect("h:mm:ss"), Some(3723.0));
        assert_eq!(parse_timecode("0:00:01.250").expect("ms"), Some(1.25));
        assert_eq!(parse_timecode("-5").expect("negative"), Some(-5.0));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["abc", "1:2:3:4", "1::2", "1:", "--3", "1.2.3"] {
            assert!(parse_timecode(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn formats_for_ffmpeg() {
        assert_eq!(format_seconds(62.0), "62");
        assert_eq!(format_seconds(1.25), "1.25");
        assert_eq!(format_seconds(0.0), "0");
        assert_eq!(format_seconds(3.14159), "3.142");
    }

    #[test]
    fn ordered_bounds_pass() {
        for (s, e) in [(0.0, 0.5), (0.0, 10.0), (5.0, 5.001), (59.0, 3600.0)] {
            assert!(ClipRange::new(Some(s), Some(e)).is_ok(), "{s}..{e}");
        }
        assert!(ClipRange::new(None, Some(1.0)).is_ok());
        assert!(ClipRange::new(Some(0.0), None).is_ok());
        assert!(ClipRange::new(None, None).expect("empty").is_empty());
    }

    #[test]
    fn end_not_after_start_is_rejected() {
        for (s, e) in [(5.0, 5.0), (10.0, 2.0)] {
            let err = ClipRange::new(Some(s), Some(e)).expect_err("must fail");
            assert!(err.to_string().contains(END_NOT_AFTER_START), "{err}");
        }
    }

    #[test]
    fn negative_start_and_non_positive_end_are_rejected() {
        let err = ClipRange::new(Some(-1.0), None).expect_err("negative start");
        assert!(err.to_string().contains(START_NEGATIVE));

        let err = ClipRange::new(None, Some(0.0)).expect_err("zero end");
        assert!(err.to_string().contains(END_NOT_POSITIVE));

        let problems = ClipRange::validate_all(Some(-2.0), Some(-3.0));
        assert_eq!(problems, vec![START_NEGATIVE, END_NOT_POSITIVE, END_NOT_AFTER_START]);
    }
}
