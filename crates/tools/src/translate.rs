//! Broker tables to records.
//!
//! A [`Table`] is coerced column by column according to a declared shape.
//! Gateway null markers become explicit nulls; anything else that is not a
//! number in a numeric column is an error. Typed records are then built from
//! the generic [`Record`] and rendered as a text preview plus a JSON payload.

use chrono::Utc;
use futumcp_core::*;
use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::str::FromStr;

use crate::result::ToolResult;

/// Records shown in a text summary before it is truncated.
pub const PREVIEW_LIMIT: usize = 10;

const NULL_MARKERS: [&str; 6] = ["", "nan", "n/a", "null", "none", "--"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranslateError {
    #[error("column '{column}' row {row}: expected a number, got {value}")]
    NotNumeric {
        column: String,
        row: usize,
        value: String,
    },
    #[error("row {row} has no value for required field '{field}'")]
    MissingValue { field: &'static str, row: usize },
    #[error("could not serialize {kind} records: {reason}")]
    Serialize { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Decimal,
    Integer,
    /// A decimal that may carry a trailing `%`.
    Percent,
}

/// One output field and the gateway columns it may be read from.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Candidate source columns, first present wins.
    pub columns: &'static [&'static str],
    pub kind: FieldKind,
}

const fn field(name: &'static str, columns: &'static [&'static str], kind: FieldKind) -> FieldSpec {
    FieldSpec { name, columns, kind }
}

/// A coerced cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Decimal(Decimal),
    Integer(i64),
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Null => serializer.serialize_none(),
            Cell::Text(s) => serializer.serialize_str(s),
            Cell::Decimal(d) => Serialize::serialize(d, serializer),
            Cell::Integer(i) => serializer.serialize_i64(*i),
        }
    }
}

/// A flat record whose fields keep the order of the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<(&'static str, Cell)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, c)| c)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Cell::Text(s) => Some(s.clone()),
            Cell::Decimal(d) => Some(d.to_string()),
            Cell::Integer(i) => Some(i.to_string()),
            Cell::Null => None,
        }
    }

    pub fn decimal(&self, name: &str) -> Option<Decimal> {
        match self.get(name)? {
            Cell::Decimal(d) => Some(*d),
            Cell::Integer(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Cell::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, cell) in &self.fields {
            map.serialize_entry(name, cell)?;
        }
        map.end()
    }
}

fn is_null_marker(s: &str) -> bool {
    let trimmed = s.trim();
    NULL_MARKERS.iter().any(|m| trimmed.eq_ignore_ascii_case(m))
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim().replace(',', "");
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .ok()
}

fn coerce(value: &Value, kind: FieldKind, column: &str, row: usize) -> Result<Cell, TranslateError> {
    let not_numeric = || TranslateError::NotNumeric {
        column: column.to_string(),
        row,
        value: value.to_string(),
    };

    match value {
        Value::Null => return Ok(Cell::Null),
        Value::String(s) if is_null_marker(s) => return Ok(Cell::Null),
        _ => {}
    }

    match kind {
        FieldKind::Text => Ok(match value {
            Value::String(s) => Cell::Text(s.trim().to_string()),
            other => Cell::Text(other.to_string()),
        }),
        FieldKind::Decimal | FieldKind::Percent => {
            let parsed = match value {
                Value::Number(n) => parse_decimal(&n.to_string()),
                Value::String(s) if kind == FieldKind::Percent => {
                    parse_decimal(s.trim().trim_end_matches('%'))
                }
                Value::String(s) => parse_decimal(s),
                _ => None,
            };
            parsed.map(Cell::Decimal).ok_or_else(not_numeric)
        }
        FieldKind::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                }),
                Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
                    parse_decimal(s)
                        .filter(|d| d.fract().is_zero())
                        .and_then(|d| i64::try_from(d).ok())
                }),
                _ => None,
            };
            parsed.map(Cell::Integer).ok_or_else(not_numeric)
        }
    }
}

/// Coerce every row of `table` into a record of `shape`.
pub fn to_records(table: &Table, shape: &[FieldSpec]) -> Result<Vec<Record>, TranslateError> {
    let indices: Vec<Option<usize>> = shape
        .iter()
        .map(|spec| spec.columns.iter().find_map(|c| table.column_index(c)))
        .collect();

    table
        .rows
        .iter()
        .enumerate()
        .map(|(row_no, row)| {
            let mut fields = Vec::with_capacity(shape.len());
            for (spec, idx) in shape.iter().zip(&indices) {
                let cell = match idx.and_then(|i| row.get(i)) {
                    Some(value) => coerce(value, spec.kind, spec.name, row_no)?,
                    None => Cell::Null,
                };
                fields.push((spec.name, cell));
            }
            Ok(Record { fields })
        })
        .collect()
}

/// Types that can be built from a translated record.
pub trait FromRecord: Sized {
    const SHAPE: &'static [FieldSpec];

    fn from_record(record: &Record, row: usize) -> Result<Self, TranslateError>;
}

/// Translate a whole table into typed records.
pub fn translate<T: FromRecord>(table: &Table) -> Result<Vec<T>, TranslateError> {
    to_records(table, T::SHAPE)?
        .iter()
        .enumerate()
        .map(|(row, record)| T::from_record(record, row))
        .collect()
}

fn required(record: &Record, field: &'static str, row: usize) -> Result<String, TranslateError> {
    record
        .text(field)
        .filter(|s| !s.is_empty())
        .ok_or(TranslateError::MissingValue { field, row })
}

fn market_of(record: &Record, code: &str) -> Option<Market> {
    record
        .text("market")
        .and_then(|m| m.parse().ok())
        .or_else(|| Market::of_code(code))
}

use FieldKind::{Decimal as Dec, Integer as Int, Percent as Pct, Text};

impl FromRecord for QuoteRecord {
    const SHAPE: &'static [FieldSpec] = &[
        field("code", &["code"], Text),
        field("name", &["name", "stock_name"], Text),
        field("last_price", &["last_price"], Dec),
        field("open_price", &["open_price"], Dec),
        field("high_price", &["high_price"], Dec),
        field("low_price", &["low_price"], Dec),
        field("prev_close_price", &["prev_close_price"], Dec),
        field("volume", &["volume"], Int),
        field("turnover", &["turnover"], Dec),
        field("change_val", &["change_val", "price_spread"], Dec),
        field("change_rate", &["change_rate"], Pct),
        field("update_time", &["update_time", "data_time"], Text),
        field("status", &["sec_status", "status"], Text),
    ];

    fn from_record(r: &Record, row: usize) -> Result<Self, TranslateError> {
        let last_price = r.decimal("last_price");
        let prev_close_price = r.decimal("prev_close_price");
        let change_val = r
            .decimal("change_val")
            .or_else(|| last_price?.checked_sub(prev_close_price?));
        let change_rate = r.decimal("change_rate").or_else(|| {
            let prev = prev_close_price.filter(|p| !p.is_zero())?;
            let rate = change_val?.checked_div(prev)?.checked_mul(Decimal::ONE_HUNDRED)?;
            Some(rate.round_dp(2))
        });
        Ok(Self {
            code: required(r, "code", row)?,
            name: r.text("name"),
            last_price,
            open_price: r.decimal("open_price"),
            high_price: r.decimal("high_price"),
            low_price: r.decimal("low_price"),
            prev_close_price,
            volume: r.integer("volume"),
            turnover: r.decimal("turnover"),
            change_val,
            change_rate,
            update_time: r.text("update_time"),
            status: r.text("status"),
        })
    }
}

impl FromRecord for HistoryBar {
    const SHAPE: &'static [FieldSpec] = &[
        field("time_key", &["time_key"], Text),
        field("open", &["open"], Dec),
        field("high", &["high"], Dec),
        field("low", &["low"], Dec),
        field("close", &["close"], Dec),
        field("volume", &["volume"], Int),
        field("turnover", &["turnover"], Dec),
        field("change_rate", &["change_rate"], Pct),
    ];

    fn from_record(r: &Record, _row: usize) -> Result<Self, TranslateError> {
        Ok(Self {
            time_key: r.text("time_key"),
            open: r.decimal("open"),
            high: r.decimal("high"),
            low: r.decimal("low"),
            close: r.decimal("close"),
            volume: r.integer("volume"),
            turnover: r.decimal("turnover"),
            change_rate: r.decimal("change_rate"),
        })
    }
}

impl FromRecord for WatchlistEntry {
    const SHAPE: &'static [FieldSpec] = &[
        field("code", &["code"], Text),
        field("name", &["name", "stock_name"], Text),
        field("market", &["market"], Text),
        field("security_type", &["stock_type", "security_type"], Text),
        field("lot_size", &["lot_size"], Int),
        field("listing_date", &["listing_date", "list_time"], Text),
    ];

    fn from_record(r: &Record, row: usize) -> Result<Self, TranslateError> {
        let code = required(r, "code", row)?;
        Ok(Self {
            market: market_of(r, &code),
            name: r.text("name"),
            security_type: r.text("security_type"),
            lot_size: r.integer("lot_size"),
            listing_date: r.text("listing_date"),
            code,
        })
    }
}

impl FromRecord for WatchlistGroup {
    const SHAPE: &'static [FieldSpec] = &[
        field("name", &["group_name", "name"], Text),
        field("group_type", &["group_type"], Text),
    ];

    fn from_record(r: &Record, row: usize) -> Result<Self, TranslateError> {
        Ok(Self {
            name: required(r, "name", row)?,
            group_type: r.text("group_type"),
        })
    }
}

impl FromRecord for StockMatch {
    const SHAPE: &'static [FieldSpec] = &[
        field("code", &["code"], Text),
        field("name", &["name", "stock_name"], Text),
        field("market", &["market"], Text),
        field("security_type", &["stock_type", "security_type"], Text),
        field("listing_status", &["listing_status", "delisting"], Text),
    ];

    fn from_record(r: &Record, row: usize) -> Result<Self, TranslateError> {
        let code = required(r, "code", row)?;
        Ok(Self {
            market: market_of(r, &code),
            name: r.text("name"),
            security_type: r.text("security_type"),
            listing_status: r.text("listing_status"),
            code,
        })
    }
}

impl FromRecord for PositionRecord {
    const SHAPE: &'static [FieldSpec] = &[
        field("code", &["code"], Text),
        field("name", &["name", "stock_name"], Text),
        field("qty", &["qty"], Dec),
        field("can_sell_qty", &["can_sell_qty"], Dec),
        field("cost_price", &["cost_price"], Dec),
        field("nominal_price", &["nominal_price"], Dec),
        field("market_val", &["market_val"], Dec),
        field("pl_val", &["pl_val"], Dec),
        field("pl_ratio", &["pl_ratio"], Pct),
        field("position_side", &["position_side"], Text),
    ];

    fn from_record(r: &Record, row: usize) -> Result<Self, TranslateError> {
        Ok(Self {
            code: required(r, "code", row)?,
            name: r.text("name"),
            qty: r.decimal("qty"),
            can_sell_qty: r.decimal("can_sell_qty"),
            cost_price: r.decimal("cost_price"),
            nominal_price: r.decimal("nominal_price"),
            market_val: r.decimal("market_val"),
            pl_val: r.decimal("pl_val"),
            pl_ratio: r.decimal("pl_ratio"),
            position_side: r.text("position_side"),
        })
    }
}

impl FromRecord for AccountSnapshot {
    const SHAPE: &'static [FieldSpec] = &[
        field("account_id", &["acc_id", "account_id"], Text),
        field("account_type", &["trd_env"], Text),
        field("currency", &["currency"], Text),
        field("total_assets", &["total_assets"], Dec),
        field("cash", &["cash"], Dec),
        field("market_val", &["market_val"], Dec),
        field("available_cash", &["avl_withdrawal_cash", "available_funds"], Dec),
        field("buying_power", &["power"], Dec),
    ];

    fn from_record(r: &Record, _row: usize) -> Result<Self, TranslateError> {
        Ok(Self {
            account_id: r.text("account_id"),
            account_type: r
                .text("account_type")
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
            currency: r.text("currency"),
            total_assets: r.decimal("total_assets"),
            cash: r.decimal("cash"),
            market_val: r.decimal("market_val"),
            available_cash: r.decimal("available_cash"),
            buying_power: r.decimal("buying_power"),
            updated_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Quote,
    History,
    Watchlist,
    WatchlistGroup,
    Stock,
    Position,
    Account,
    Snapshot,
}

impl RecordKind {
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Quote => "quote",
            RecordKind::History => "history",
            RecordKind::Watchlist => "watchlist",
            RecordKind::WatchlistGroup => "watchlist group",
            RecordKind::Stock => "stock",
            RecordKind::Position => "position",
            RecordKind::Account => "account",
            RecordKind::Snapshot => "market snapshot",
        }
    }
}

/// One-line rendering of a record for the text summary.
pub trait Preview {
    fn preview(&self) -> String;
}

fn opt<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map_or_else(|| "-".to_string(), ToString::to_string)
}

fn pct(v: &Option<Decimal>) -> String {
    v.map_or_else(|| "-".to_string(), |d| format!("{:+}%", d.round_dp(2)))
}

impl Preview for QuoteRecord {
    fn preview(&self) -> String {
        format!(
            "{} {}: last {} ({}) vol {}",
            self.code,
            opt(&self.name),
            opt(&self.last_price),
            pct(&self.change_rate),
            opt(&self.volume)
        )
    }
}

impl Preview for HistoryBar {
    fn preview(&self) -> String {
        format!(
            "{}: O {} H {} L {} C {} V {}",
            opt(&self.time_key),
            opt(&self.open),
            opt(&self.high),
            opt(&self.low),
            opt(&self.close),
            opt(&self.volume)
        )
    }
}

impl Preview for WatchlistEntry {
    fn preview(&self) -> String {
        format!("{} {} [{}]", self.code, opt(&self.name), opt(&self.security_type))
    }
}

impl Preview for WatchlistGroup {
    fn preview(&self) -> String {
        format!("{} ({})", self.name, opt(&self.group_type))
    }
}

impl Preview for StockMatch {
    fn preview(&self) -> String {
        format!("{} {} [{}]", self.code, opt(&self.name), opt(&self.security_type))
    }
}

impl Preview for PositionRecord {
    fn preview(&self) -> String {
        format!(
            "{} {}: qty {} cost {} now {} P/L {} ({})",
            self.code,
            opt(&self.name),
            opt(&self.qty),
            opt(&self.cost_price),
            opt(&self.nominal_price),
            opt(&self.pl_val),
            pct(&self.pl_ratio)
        )
    }
}

impl Preview for AccountSnapshot {
    fn preview(&self) -> String {
        format!(
            "{} account {} ({}): total {} cash {} positions {} buying power {}",
            self.account_type,
            opt(&self.account_id),
            opt(&self.currency),
            opt(&self.total_assets),
            opt(&self.cash),
            opt(&self.market_val),
            opt(&self.buying_power)
        )
    }
}

impl Preview for MarketSnapshot {
    fn preview(&self) -> String {
        format!(
            "{} market: {} up, {} down, {} flat; top gainer {}, top loser {}",
            self.market,
            self.advancers,
            self.decliners,
            self.unchanged,
            opt(&self.top_gainer),
            opt(&self.top_loser)
        )
    }
}

/// Short text block: a count line then up to [`PREVIEW_LIMIT`] lines.
pub fn summarize<T: Preview>(records: &[T], kind: RecordKind) -> String {
    if records.is_empty() {
        return format!("No {} data", kind.label());
    }

    let mut lines = Vec::with_capacity(records.len().min(PREVIEW_LIMIT) + 2);
    let noun = if records.len() == 1 { "record" } else { "records" };
    lines.push(format!("{} {} {}:", records.len(), kind.label(), noun));
    lines.extend(records.iter().take(PREVIEW_LIMIT).map(|r| format!("- {}", r.preview())));
    if records.len() > PREVIEW_LIMIT {
        lines.push(format!("... and {} more", records.len() - PREVIEW_LIMIT));
    }
    lines.join("\n")
}

/// Text summary plus the full records as a JSON array.
pub fn render<T: Preview + Serialize>(records: &[T], kind: RecordKind) -> Result<ToolResult, TranslateError> {
    let payload = serde_json::to_value(records).map_err(|e| TranslateError::Serialize {
        kind: kind.label(),
        reason: e.to_string(),
    })?;
    Ok(ToolResult::success(summarize(records, kind), payload))
}
