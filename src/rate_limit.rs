use crate::types::{ProviderId, RateLimitWindow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::header::HeaderMap;

pub const RESOURCES: &[&str] = &["requests", "tokens"];

/// Parses `1m30s`, `250ms`, `2h`, `6m0.5s` or bare seconds into seconds.
/// Anything else (including the empty string) yields `None`.
pub fn parse_duration_secs(input: &str) -> Option<f64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return if secs.is_finite() && secs >= 0.0 { Some(secs) } else { None };
    }

    let bytes = s.as_bytes();
    let mut total = 0.0;
    let mut i = 0;
    while i < bytes.len() {
        let num_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == num_start {
            return None;
        }
        let value: f64 = s[num_start..i].parse().ok()?;

        let unit_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let multiplier = match &s[unit_start..i] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3_600.0,
            "d" => 86_400.0,
            _ => return None,
        };
        total += value * multiplier;
    }
    Some(total)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse::<f64>().ok()).and_then(|v| {
        if v.is_finite() && v >= 0.0 {
            Some(v as u64)
        } else {
            None
        }
    })
}

/// Resets arrive as durations (`1m30s`), relative seconds, or epoch timestamps
/// depending on the vendor.
fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(n) = value.parse::<f64>() {
        if n > 1e12 {
            return Utc.timestamp_millis_opt(n as i64).single();
        }
        if n > 1e9 {
            return Utc.timestamp_opt(n as i64, 0).single();
        }
    }
    let secs = parse_duration_secs(value)?;
    Some(now + Duration::milliseconds((secs * 1000.0).round() as i64))
}

fn window_from(
    headers: &HeaderMap,
    limit: &str,
    remaining: &str,
    reset: &str,
    now: DateTime<Utc>,
) -> RateLimitWindow {
    RateLimitWindow {
        limit: header_u64(headers, limit),
        remaining: header_u64(headers, remaining),
        reset_at: header_str(headers, reset).and_then(|v| parse_reset(v, now)),
    }
}

/// Returns one window per resource class with at least one parsable field.
pub fn extract_windows(
    provider: ProviderId,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Vec<(String, RateLimitWindow)> {
    let mut windows = Vec::new();
    for resource in RESOURCES {
        let window = match provider {
            ProviderId::Anthropic => window_from(
                headers,
                &format!("anthropic-ratelimit-{}-limit", resource),
                &format!("anthropic-ratelimit-{}-remaining", resource),
                &format!("anthropic-ratelimit-{}-reset", resource),
                now,
            ),
            _ => window_from(
                headers,
                &format!("x-ratelimit-limit-{}", resource),
                &format!("x-ratelimit-remaining-{}", resource),
                &format!("x-ratelimit-reset-{}", resource),
                now,
            ),
        };
        if !window.is_empty() {
            windows.push((resource.to_string(), window));
        }
    }

    // OpenRouter sends a single unsuffixed family for requests.
    if windows.is_empty() && provider != ProviderId::Anthropic {
        let window = window_from(
            headers,
            "x-ratelimit-limit",
            "x-ratelimit-remaining",
            "x-ratelimit-reset",
            now,
        );
        if !window.is_empty() {
            windows.push(("requests".to_string(), window));
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn fixed_now() -> DateTime<Utc> {
        match DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z") {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => panic!("bad fixture: {}", e),
        }
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration_secs("1m30s"), Some(90.0));
        assert_eq!(parse_duration_secs("90"), Some(90.0));
        assert_eq!(parse_duration_secs("2h"), Some(7200.0));
        assert_eq!(parse_duration_secs("250ms"), Some(0.25));
        assert_eq!(parse_duration_secs("1d1h"), Some(90_000.0));
        assert_eq!(parse_duration_secs("6m0.5s"), Some(360.5));
        assert_eq!(parse_duration_secs(""), None);
        assert_eq!(parse_duration_secs("abc"), None);
        assert_eq!(parse_duration_secs("5x"), None);
        assert_eq!(parse_duration_secs("s"), None);
    }

    #[test]
    fn test_openai_family() {
        let h = headers(&[
            ("x-ratelimit-limit-requests", "500"),
            ("x-ratelimit-remaining-requests", "499"),
            ("x-ratelimit-reset-requests", "1m30s"),
            ("x-ratelimit-reset-tokens", "garbage"),
        ]);
        let windows = extract_windows(ProviderId::OpenAi, &h, fixed_now());
        assert_eq!(windows.len(), 1);
        let (resource, window) = &windows[0];
        assert_eq!(resource, "requests");
        assert_eq!(window.limit, Some(500));
        assert_eq!(window.remaining, Some(499));
        assert_eq!(window.reset_at, Some(fixed_now() + Duration::seconds(90)));
    }

    #[test]
    fn test_anthropic_family_uses_rfc3339() {
        let h = headers(&[
            ("anthropic-ratelimit-tokens-limit", "40000"),
            ("anthropic-ratelimit-tokens-remaining", "39000"),
            ("anthropic-ratelimit-tokens-reset", "2025-01-01T00:01:00Z"),
        ]);
        let windows = extract_windows(ProviderId::Anthropic, &h, fixed_now());
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0, "tokens");
        assert_eq!(windows[0].1.reset_at, Some(fixed_now() + Duration::seconds(60)));
    }

    #[test]
    fn test_openrouter_epoch_millis() {
        let h = headers(&[
            ("x-ratelimit-limit", "20"),
            ("x-ratelimit-remaining", "19"),
            ("x-ratelimit-reset", "1735689660000"),
        ]);
        let windows = extract_windows(ProviderId::OpenRouter, &h, fixed_now());
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].1.reset_at, Some(fixed_now() + Duration::seconds(60)));
    }

    #[test]
    fn test_no_headers_no_windows() {
        assert!(extract_windows(ProviderId::Groq, &HeaderMap::new(), fixed_now()).is_empty());
    }
}
