use anyhow::{Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One offer as read off a page, before it is tagged with a direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedBid {
    #[serde(deserialize_with = "deserialize_number")]
    pub rate: f64,
    #[serde(deserialize_with = "deserialize_number")]
    pub amount: f64,
    pub phone: String,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Turns a fetched body into bids.
pub trait Parser: Send + Sync {
    fn parse(&self, body: &str) -> Result<Vec<ParsedBid>>;
}

// Sites print numbers as "26,15", "1 000" or "26.15 грн"
fn number_pattern() -> Result<Regex> {
    Regex::new(r"-?\d+(?:\.\d+)?").context("Failed to compile number pattern")
}

// A lone comma is a decimal separator; next to a dot, or repeated, commas
// group thousands
fn parse_number_with(re: &Regex, raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let commas = compact.matches(',').count();
    let normalized = if commas == 1 && !compact.contains('.') {
        compact.replace(',', ".")
    } else {
        compact.replace(',', "")
    };
    if normalized.matches('.').count() > 1 {
        return None;
    }
    re.find(&normalized)?.as_str().parse().ok()
}

/// Normalise a human-formatted number. Spaces (including non-breaking ones)
/// are dropped and a decimal comma is accepted. Commas next to a decimal dot
/// or repeated commas are read as thousands separators; several dots make
/// the value ambiguous and it is rejected.
pub fn parse_number(raw: &str) -> Option<f64> {
    let re = number_pattern().ok()?;
    parse_number_with(&re, raw)
}

pub(crate) fn deserialize_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrFloat {
        Float(f64),
        String(String),
    }

    match StringOrFloat::deserialize(deserializer)? {
        StringOrFloat::Float(f) => Ok(f),
        StringOrFloat::String(s) => parse_number(&s)
            .ok_or_else(|| de::Error::custom(format!("not a number: '{}'", s))),
    }
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// HTML listing where every `tbody tr` is one offer and the cells after the
/// first hold rate, amount and phone.
#[derive(Debug, Default)]
pub struct TableParser;

impl Parser for TableParser {
    fn parse(&self, body: &str) -> Result<Vec<ParsedBid>> {
        let document = Html::parse_document(body);
        let rows = Selector::parse("tbody tr")
            .map_err(|e| anyhow::anyhow!("Invalid row selector: {}", e))?;
        let cells = Selector::parse("td")
            .map_err(|e| anyhow::anyhow!("Invalid cell selector: {}", e))?;
        let re = number_pattern()?;

        let mut bids = Vec::new();
        for row in document.select(&rows) {
            let texts: Vec<String> = row.select(&cells).map(|c| cell_text(&c)).collect();
            if texts.len() < 4 {
                debug!(cells = texts.len(), "Skipping short table row");
                continue;
            }

            let (Some(rate), Some(amount)) = (
                parse_number_with(&re, &texts[1]),
                parse_number_with(&re, &texts[2]),
            ) else {
                debug!(rate = %texts[1], amount = %texts[2], "Skipping row without numbers");
                continue;
            };

            bids.push(ParsedBid {
                rate,
                amount,
                phone: texts[3].clone(),
                currency: None,
            });
        }
        Ok(bids)
    }
}

/// JSON array of `{rate, amount, phone, currency?}` objects.
#[derive(Debug, Default)]
pub struct JsonParser;

impl Parser for JsonParser {
    fn parse(&self, body: &str) -> Result<Vec<ParsedBid>> {
        serde_json::from_str(body).context("Failed to parse bids JSON")
    }
}

/// Placeholder for resources that have no parser yet.
#[derive(Debug, Default)]
pub struct DummyParser;

impl Parser for DummyParser {
    fn parse(&self, _body: &str) -> Result<Vec<ParsedBid>> {
        Ok(Vec::new())
    }
}
