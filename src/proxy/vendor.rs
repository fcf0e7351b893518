//! Wire formats of the proxy vendor: the extraction body (`ip:port user pass`
//! lines, newline- or backslash-separated) and the quota count endpoint.

use serde::{Deserialize, Deserializer};

/// Remaining extraction quota as reported by the vendor count endpoint.
#[derive(Debug, Clone, Default)]
pub struct ExtractionStats {
    pub expire_at: i64,
    pub remaining_products: i64,
    pub remaining_connects: i64,
    pub remaining_extracts: i64,
    pub available: bool,
}

/// The vendor emits numeric fields as either JSON numbers or strings,
/// sometimes both within one response.
fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct CountEntry {
    #[serde(default)]
    expire_time: String,
    #[serde(default)]
    is_available: bool,
    #[serde(default, deserialize_with = "int_or_string")]
    remain_connect: i64,
    #[serde(default, deserialize_with = "int_or_string")]
    remain_extract: i64,
    #[serde(default, deserialize_with = "int_or_string")]
    remain: i64,
}

#[derive(Deserialize)]
struct CountResponse {
    code: i64,
    #[serde(default)]
    data: Vec<CountEntry>,
}

/// Parse the count endpoint body. Any malformation, a non-200 vendor code, or
/// an unavailable account yields zeroed stats (the refill path treats that as
/// "no quota, do not fetch").
pub fn parse_count_response(body: &str) -> ExtractionStats {
    let body: String = body.chars().filter(|c| *c != '\n').collect();
    let Ok(response) = serde_json::from_str::<CountResponse>(&body) else {
        return ExtractionStats::default();
    };
    if response.code != 200 {
        return ExtractionStats::default();
    }
    let Some(entry) = response.data.last() else {
        return ExtractionStats::default();
    };
    if !entry.is_available {
        return ExtractionStats::default();
    }
    let expire_at = chrono::NaiveDateTime::parse_from_str(&entry.expire_time, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0);
    ExtractionStats {
        expire_at,
        remaining_products: entry.remain,
        remaining_connects: entry.remain_connect,
        remaining_extracts: entry.remain_extract,
        available: true,
    }
}

/// Split a vendor extraction body into record candidates. Some vendor plans
/// separate records with backslashes instead of newlines.
pub fn split_proxy_lines(body: &str) -> Vec<&str> {
    body.split(|c| c == '\n' || c == '\\')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}
