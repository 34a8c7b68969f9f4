//! The shipped family mappers. Each is a pure projection from one parsed
//! raw payload to an event draft; all I/O stays in the engine.
//!
//! Shared conventions: the source URL is mandatory for every family, dates
//! go through the feed-date parser and are dropped (not guessed) when they
//! do not parse, and `event_date` stays empty whenever the source only says
//! when something was published.

use codh_core::amount::parse_localized_amount;
use codh_core::normalize::{canonical_key, parse_feed_date};
use codh_store::records::StoredSourceRecord;
use serde_json::{Map, Value as JsonValue};

use crate::{FamilyMapper, IndicatorPointDraft, Mapped, MoneyRecordDraft, PolicyEventDraft};

fn text_field<'a>(payload: &'a Map<String, JsonValue>, name: &str) -> Option<&'a str> {
    payload
        .get(name)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn iso_date(payload: &Map<String, JsonValue>, name: &str) -> Option<String> {
    text_field(payload, name)
        .and_then(parse_feed_date)
        .map(|d| d.to_string())
}

/// Numeric payloads arrive either as JSON numbers or as locale-formatted
/// strings; both resolve through the same disambiguation rules.
fn numeric_field(payload: &Map<String, JsonValue>, name: &str) -> Option<f64> {
    match payload.get(name)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_localized_amount(s),
        _ => None,
    }
}

/// Executive actions (decrees, agreements, appointments). Feeds of this
/// family carry discovery/index rows alongside real actions; index rows are
/// filtered out by their declared kind.
#[derive(Debug, Clone, Default)]
pub struct ExecutiveActionsMapper;

impl FamilyMapper for ExecutiveActionsMapper {
    fn family(&self) -> &'static str {
        "executive-actions"
    }

    fn map(&self, record: &StoredSourceRecord, payload: &Map<String, JsonValue>) -> Mapped {
        if text_field(payload, "kind") == Some("index") {
            return Mapped::Skip("index-row");
        }
        let Some(title) = text_field(payload, "title") else {
            return Mapped::Skip("missing-title");
        };
        let Some(url) = text_field(payload, "url") else {
            return Mapped::Skip("missing-source-url");
        };

        Mapped::Policy(PolicyEventDraft {
            event_id: format!(
                "executive-actions:{}:{}",
                record.source_code, record.source_record_id
            ),
            title: title.to_string(),
            event_date: iso_date(payload, "event_date"),
            published_date: iso_date(payload, "published_date"),
            source_url: url.to_string(),
        })
    }
}

/// Legal-gazette announcements, keyed by the gazette's own reference number
/// when one can be extracted, so the same announcement seen through two
/// feeds collapses onto one event.
#[derive(Debug, Clone, Default)]
pub struct GazetteMapper;

impl GazetteMapper {
    /// A stable reference either sits in its own field or is embedded in
    /// the title as a `BOE-`-prefixed token.
    fn reference(payload: &Map<String, JsonValue>) -> Option<String> {
        if let Some(reference) = text_field(payload, "reference") {
            return Some(reference.to_string());
        }
        text_field(payload, "title")?
            .split_whitespace()
            .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
            .find(|token| token.starts_with("BOE-") && token.len() > 4)
            .map(str::to_string)
    }
}

impl FamilyMapper for GazetteMapper {
    fn family(&self) -> &'static str {
        "gazette"
    }

    fn map(&self, record: &StoredSourceRecord, payload: &Map<String, JsonValue>) -> Mapped {
        let Some(title) = text_field(payload, "title") else {
            return Mapped::Skip("missing-title");
        };
        let Some(url) = text_field(payload, "url") else {
            return Mapped::Skip("missing-source-url");
        };

        let event_id = match Self::reference(payload) {
            Some(reference) => format!("gazette:{reference}"),
            None => format!("gazette:{}:{}", record.source_code, record.source_record_id),
        };

        // Gazette items only tell us when they were published; the underlying
        // act's own date is not derivable, so it stays empty.
        Mapped::Policy(PolicyEventDraft {
            event_id,
            title: title.to_string(),
            event_date: None,
            published_date: iso_date(payload, "published_date"),
            source_url: url.to_string(),
        })
    }
}

/// Money flows: contracts, subsidies, grants. Amounts arrive in mixed
/// locale formats and stay optional; an announcement without an amount is
/// still an event.
#[derive(Debug, Clone, Default)]
pub struct MoneyMapper;

impl FamilyMapper for MoneyMapper {
    fn family(&self) -> &'static str {
        "money"
    }

    fn map(&self, record: &StoredSourceRecord, payload: &Map<String, JsonValue>) -> Mapped {
        let Some(title) = text_field(payload, "title") else {
            return Mapped::Skip("missing-title");
        };
        let Some(url) = text_field(payload, "url") else {
            return Mapped::Skip("missing-source-url");
        };

        Mapped::Money(MoneyRecordDraft {
            event_id: format!("money:{}:{}", record.source_code, record.source_record_id),
            title: title.to_string(),
            amount: numeric_field(payload, "amount"),
            currency: text_field(payload, "currency").map(str::to_string),
            event_date: iso_date(payload, "event_date"),
            published_date: iso_date(payload, "published_date"),
            source_url: url.to_string(),
        })
    }
}

/// Statistical indicators: each record is one observation of one series.
#[derive(Debug, Clone, Default)]
pub struct IndicatorsMapper;

impl FamilyMapper for IndicatorsMapper {
    fn family(&self) -> &'static str {
        "indicators"
    }

    fn map(&self, _record: &StoredSourceRecord, payload: &Map<String, JsonValue>) -> Mapped {
        let Some(series_title) = text_field(payload, "series") else {
            return Mapped::Skip("missing-series");
        };
        let Some(series_key) = canonical_key(series_title) else {
            return Mapped::Skip("missing-series");
        };
        let Some(period) = text_field(payload, "period") else {
            return Mapped::Skip("missing-period");
        };
        let Some(value) = numeric_field(payload, "value") else {
            return Mapped::Skip("missing-value");
        };
        let Some(url) = text_field(payload, "url") else {
            return Mapped::Skip("missing-source-url");
        };

        Mapped::IndicatorPoint(IndicatorPointDraft {
            series_key,
            series_title: series_title.to_string(),
            unit: text_field(payload, "unit").map(str::to_string),
            period: period.to_string(),
            value,
            source_url: url.to_string(),
        })
    }
}
