//! Record model shared by the normalizer, the snapshot store and the views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Column order of every snapshot file. Stable; the header is written once.
pub const CSV_COLUMNS: [&str; 10] = [
    "timestamp",
    "game_id",
    "commence_time",
    "home_team",
    "away_team",
    "bookmaker",
    "market",
    "outcome_name",
    "price",
    "point",
];

/// Bet category. Serialized with the upstream market keys so files stay
/// readable alongside history written by earlier loggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Market {
    #[serde(rename = "h2h", alias = "moneyline")]
    Moneyline,
    #[serde(rename = "spreads", alias = "spread")]
    Spread,
    #[serde(rename = "totals", alias = "total")]
    Total,
}

impl Market {
    pub const ALL: [Market; 3] = [Market::Moneyline, Market::Spread, Market::Total];

    /// Upstream market key (`h2h`, `spreads`, `totals`).
    pub fn api_key(&self) -> &'static str {
        match self {
            Market::Moneyline => "h2h",
            Market::Spread => "spreads",
            Market::Total => "totals",
        }
    }

    pub fn from_api_key(key: &str) -> Option<Self> {
        match key {
            "h2h" => Some(Market::Moneyline),
            "spreads" => Some(Market::Spread),
            "totals" => Some(Market::Total),
            _ => None,
        }
    }

    /// Dashboard section title.
    pub fn title(&self) -> &'static str {
        match self {
            Market::Moneyline => "MONEYLINE",
            Market::Spread => "POINT SPREAD",
            Market::Total => "TOTAL POINTS",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_key())
    }
}

impl FromStr for Market {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        Market::from_api_key(&key)
            .or(match key.as_str() {
                "moneyline" => Some(Market::Moneyline),
                "spread" => Some(Market::Spread),
                "total" => Some(Market::Total),
                _ => None,
            })
            .ok_or_else(|| format!("unknown market '{}'", s))
    }
}

/// One row of the flat odds time series.
///
/// `price` is American odds and never zero; `point` is absent for moneyline
/// and must never be coerced to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsRecord {
    /// Ingestion instant (not game time).
    #[serde(rename = "timestamp", with = "timestamp")]
    pub recorded_at: DateTime<Utc>,
    pub game_id: String,
    #[serde(with = "timestamp")]
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub bookmaker: String,
    pub market: Market,
    pub outcome_name: String,
    pub price: i32,
    pub point: Option<f64>,
}

/// Timestamp (de)serialization for snapshot files and the quota ledger.
///
/// Writes RFC 3339 in UTC. Reads RFC 3339 and also naive ISO-8601 values
/// (no offset), which are taken as UTC; older ledgers and CSVs use that form.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }
}

// ── The Odds API v4 response ─────────────────────────────────────────
//
// Every field the normalizer requires is optional here so a single malformed
// entry can be skipped instead of failing the whole response.

/// Field decoders for upstream payloads. A field of the wrong type reads as
/// absent and a bad list element is dropped, so one malformed bookmaker
/// cannot fail the whole response.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// Numbers, or strings holding one (`"-110"`, `"+135"`).
    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        })
    }

    pub fn list<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        })
    }
}

/// The Odds API event structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiEvent {
    #[serde(deserialize_with = "lenient::string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub sport_key: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub commence_time: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub home_team: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub away_team: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub bookmakers: Vec<OddsApiBookmaker>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiBookmaker {
    #[serde(deserialize_with = "lenient::string")]
    pub key: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub last_update: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub markets: Vec<OddsApiMarket>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiMarket {
    #[serde(deserialize_with = "lenient::string")]
    pub key: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub outcomes: Vec<OddsApiOutcome>,
}

/// `price` is read as a float so `-110` and `-110.0` both decode; the
/// normalizer rejects non-integral values.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiOutcome {
    #[serde(deserialize_with = "lenient::string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub price: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub point: Option<f64>,
}
