//! Flattens one upstream response into odds records.
//!
//! Every game × bookmaker × market × outcome yields exactly one record, all
//! stamped with the same `recorded_at`. No filtering and no deduplication:
//! upstream duplicates pass through. Entries missing a required field are
//! skipped and counted; the rest of the batch is unaffected.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{
    timestamp, Market, OddsApiBookmaker, OddsApiEvent, OddsApiMarket, OddsApiOutcome, OddsRecord,
};

/// Output of one normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub recorded_at: Option<DateTime<Utc>>,
    pub records: Vec<OddsRecord>,
    /// Malformed game/bookmaker/market/outcome entries dropped.
    pub skipped: usize,
    /// Games that contributed at least the game-level fields.
    pub games: usize,
}

/// Game-level fields copied onto every record.
struct GameHeader<'a> {
    id: &'a str,
    commence_time: DateTime<Utc>,
    home_team: &'a str,
    away_team: &'a str,
}

pub fn normalize(events: &[OddsApiEvent], recorded_at: DateTime<Utc>) -> Normalized {
    let mut out = Normalized {
        recorded_at: Some(recorded_at),
        ..Normalized::default()
    };

    for event in events {
        let Some(game) = game_header(event) else {
            debug!("Skipping malformed game entry {:?}", event.id);
            out.skipped += 1;
            continue;
        };
        out.games += 1;

        for bookmaker in &event.bookmakers {
            let Some(book) = bookmaker_key(bookmaker) else {
                debug!("Skipping bookmaker without key in game {}", game.id);
                out.skipped += 1;
                continue;
            };

            for market in &bookmaker.markets {
                let Some(market_kind) = market_kind(market) else {
                    debug!("Skipping market {:?} from {} in game {}", market.key, book, game.id);
                    out.skipped += 1;
                    continue;
                };

                for outcome in &market.outcomes {
                    match outcome_fields(outcome) {
                        Some((name, price)) => out.records.push(OddsRecord {
                            recorded_at,
                            game_id: game.id.to_string(),
                            commence_time: game.commence_time,
                            home_team: game.home_team.to_string(),
                            away_team: game.away_team.to_string(),
                            bookmaker: book.to_string(),
                            market: market_kind,
                            outcome_name: name.to_string(),
                            price,
                            point: outcome.point.filter(|p| p.is_finite()),
                        }),
                        None => {
                            debug!("Skipping malformed outcome {:?} ({} {})", outcome.name, book, market_kind);
                            out.skipped += 1;
                        }
                    }
                }
            }
        }
    }

    out
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn game_header(event: &OddsApiEvent) -> Option<GameHeader<'_>> {
    Some(GameHeader {
        id: non_empty(&event.id)?,
        commence_time: timestamp::parse(non_empty(&event.commence_time)?)?,
        home_team: non_empty(&event.home_team)?,
        away_team: non_empty(&event.away_team)?,
    })
}

fn bookmaker_key(bookmaker: &OddsApiBookmaker) -> Option<&str> {
    non_empty(&bookmaker.key).or_else(|| non_empty(&bookmaker.title))
}

fn market_kind(market: &OddsApiMarket) -> Option<Market> {
    Market::from_api_key(non_empty(&market.key)?)
}

/// American odds must be a non-zero integer.
fn american_price(raw: f64) -> Option<i32> {
    if !raw.is_finite() || raw.fract() != 0.0 || raw == 0.0 {
        return None;
    }
    if raw < f64::from(i32::MIN) || raw > f64::from(i32::MAX) {
        return None;
    }
    Some(raw as i32)
}

fn outcome_fields(outcome: &OddsApiOutcome) -> Option<(&str, i32)> {
    let name = non_empty(&outcome.name)?;
    let price = american_price(outcome.price?)?;
    Some((name, price))
}
