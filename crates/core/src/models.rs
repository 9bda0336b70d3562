use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returned by the `FromStr` impls below when a value is not one of the
/// accepted spellings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Markets & security codes
// ---------------------------------------------------------------------------

/// An exchange market as identified by the gateway's code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    Us,
    Hk,
    Sh,
    Sz,
}

impl Market {
    pub const ALL: [Market; 4] = [Market::Us, Market::Hk, Market::Sh, Market::Sz];

    /// Prefix used in qualified codes (e.g. `US` in `US.AAPL`).
    pub fn prefix(&self) -> &'static str {
        match self {
            Market::Us => "US",
            Market::Hk => "HK",
            Market::Sh => "SH",
            Market::Sz => "SZ",
        }
    }

    /// Market of a qualified code such as `HK.00700`.
    pub fn of_code(code: &str) -> Option<Self> {
        let (prefix, _) = code.split_once('.')?;
        prefix.parse().ok()
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for Market {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(Market::Us),
            "HK" => Ok(Market::Hk),
            "SH" | "CN-SH" => Ok(Market::Sh),
            "SZ" | "CN-SZ" => Ok(Market::Sz),
            _ => Err(ParseEnumError::new("market", s)),
        }
    }
}

/// Qualify a security code with a market prefix.
///
/// Codes that already carry a known prefix (`US.AAPL`) are only normalized;
/// bare codes (`aapl`) get `default_market` prepended.
pub fn qualify_code(code: &str, default_market: Market) -> String {
    let code = code.trim();
    if let Some((prefix, symbol)) = code.split_once('.') {
        if let Ok(market) = prefix.parse::<Market>() {
            return format!("{}.{}", market.prefix(), symbol.to_ascii_uppercase());
        }
    }
    format!("{}.{}", default_market.prefix(), code.to_ascii_uppercase())
}

/// Region selector for market-wide snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotRegion {
    Us,
    Hk,
    Cn,
}

impl SnapshotRegion {
    /// Benchmark instruments quoted for the region.
    pub fn index_codes(&self) -> &'static [&'static str] {
        match self {
            // S&P 500, Nasdaq 100 and Dow trackers
            SnapshotRegion::Us => &["US.SPY", "US.QQQ", "US.DIA"],
            // Hang Seng, Hang Seng Tech
            SnapshotRegion::Hk => &["HK.800000", "HK.800700"],
            // SSE Composite, SZSE Component
            SnapshotRegion::Cn => &["SH.000001", "SZ.399001"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotRegion::Us => "US",
            SnapshotRegion::Hk => "HK",
            SnapshotRegion::Cn => "CN",
        }
    }
}

impl FromStr for SnapshotRegion {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(SnapshotRegion::Us),
            "HK" => Ok(SnapshotRegion::Hk),
            "CN" => Ok(SnapshotRegion::Cn),
            _ => Err(ParseEnumError::new("snapshot market", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Kline periods
// ---------------------------------------------------------------------------

/// Candlestick period for historical bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlinePeriod {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "60m")]
    Min60,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
}

impl KlinePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            KlinePeriod::Min1 => "1m",
            KlinePeriod::Min5 => "5m",
            KlinePeriod::Min15 => "15m",
            KlinePeriod::Min30 => "30m",
            KlinePeriod::Min60 => "60m",
            KlinePeriod::Day => "day",
            KlinePeriod::Week => "week",
            KlinePeriod::Month => "month",
        }
    }

    /// Gateway kline type name.
    pub fn ktype(&self) -> &'static str {
        match self {
            KlinePeriod::Min1 => "K_1M",
            KlinePeriod::Min5 => "K_5M",
            KlinePeriod::Min15 => "K_15M",
            KlinePeriod::Min30 => "K_30M",
            KlinePeriod::Min60 => "K_60M",
            KlinePeriod::Day => "K_DAY",
            KlinePeriod::Week => "K_WEEK",
            KlinePeriod::Month => "K_MON",
        }
    }

    /// Approximate bar length in minutes.
    pub fn minutes(&self) -> i64 {
        match self {
            KlinePeriod::Min1 => 1,
            KlinePeriod::Min5 => 5,
            KlinePeriod::Min15 => 15,
            KlinePeriod::Min30 => 30,
            KlinePeriod::Min60 => 60,
            KlinePeriod::Day => 60 * 24,
            KlinePeriod::Week => 60 * 24 * 7,
            KlinePeriod::Month => 60 * 24 * 30,
        }
    }
}

impl fmt::Display for KlinePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KlinePeriod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" => Ok(KlinePeriod::Min1),
            "5m" | "5min" => Ok(KlinePeriod::Min5),
            "15m" | "15min" => Ok(KlinePeriod::Min15),
            "30m" | "30min" => Ok(KlinePeriod::Min30),
            "60m" | "60min" => Ok(KlinePeriod::Min60),
            "day" => Ok(KlinePeriod::Day),
            "week" => Ok(KlinePeriod::Week),
            "month" => Ok(KlinePeriod::Month),
            _ => Err(ParseEnumError::new("period", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Trading environment of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountMode {
    Real,
    #[default]
    Simulate,
}

impl AccountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountMode::Real => "REAL",
            AccountMode::Simulate => "SIMULATE",
        }
    }
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REAL" => Ok(AccountMode::Real),
            "SIMULATE" => Ok(AccountMode::Simulate),
            _ => Err(ParseEnumError::new("account mode", s)),
        }
    }
}

/// Filter for watchlist group listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchlistGroupType {
    #[default]
    All,
    System,
    Custom,
}

impl WatchlistGroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchlistGroupType::All => "ALL",
            WatchlistGroupType::System => "SYSTEM",
            WatchlistGroupType::Custom => "CUSTOM",
        }
    }
}

impl FromStr for WatchlistGroupType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(WatchlistGroupType::All),
            "SYSTEM" => Ok(WatchlistGroupType::System),
            "CUSTOM" => Ok(WatchlistGroupType::Custom),
            _ => Err(ParseEnumError::new("group type", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Records produced from gateway tables
// ---------------------------------------------------------------------------

/// Real-time quote for one security.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub code: String,
    pub name: Option<String>,
    pub last_price: Option<Decimal>,
    pub open_price: Option<Decimal>,
    pub high_price: Option<Decimal>,
    pub low_price: Option<Decimal>,
    pub prev_close_price: Option<Decimal>,
    pub volume: Option<i64>,
    pub turnover: Option<Decimal>,
    pub change_val: Option<Decimal>,
    /// Percent change, e.g. `1.25` for +1.25%.
    pub change_rate: Option<Decimal>,
    pub update_time: Option<String>,
    pub status: Option<String>,
}

/// One OHLCV candlestick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBar {
    pub time_key: Option<String>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<i64>,
    pub turnover: Option<Decimal>,
    pub change_rate: Option<Decimal>,
}

/// A security in one of the user's watchlist groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub code: String,
    pub name: Option<String>,
    pub market: Option<Market>,
    pub security_type: Option<String>,
    pub lot_size: Option<i64>,
    pub listing_date: Option<String>,
}

/// A watchlist group as defined in the broker app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistGroup {
    pub name: String,
    pub group_type: Option<String>,
}

/// A security matched by a keyword search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMatch {
    pub code: String,
    pub name: Option<String>,
    pub market: Option<Market>,
    pub security_type: Option<String>,
    pub listing_status: Option<String>,
}

/// An open position in a trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub code: String,
    pub name: Option<String>,
    pub qty: Option<Decimal>,
    pub can_sell_qty: Option<Decimal>,
    pub cost_price: Option<Decimal>,
    pub nominal_price: Option<Decimal>,
    pub market_val: Option<Decimal>,
    pub pl_val: Option<Decimal>,
    /// Percent P/L, e.g. `-3.5` for -3.5%.
    pub pl_ratio: Option<Decimal>,
    pub position_side: Option<String>,
}

/// Funds summary of one trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: Option<String>,
    pub account_type: AccountMode,
    pub currency: Option<String>,
    pub total_assets: Option<Decimal>,
    pub cash: Option<Decimal>,
    pub market_val: Option<Decimal>,
    pub available_cash: Option<Decimal>,
    pub buying_power: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view of a market's benchmarks and movers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// `US`, `HK`, `CN`, or `CUSTOM` for an explicit code list.
    pub market: String,
    pub updated_at: DateTime<Utc>,
    pub advancers: usize,
    pub decliners: usize,
    pub unchanged: usize,
    pub top_gainer: Option<String>,
    pub top_loser: Option<String>,
    pub quotes: Vec<QuoteRecord>,
}

impl MarketSnapshot {
    /// Aggregate breadth and movers from a set of quotes.
    pub fn from_quotes(market: impl Into<String>, quotes: Vec<QuoteRecord>) -> Self {
        let mut advancers = 0;
        let mut decliners = 0;
        let mut unchanged = 0;
        for rate in quotes.iter().filter_map(|q| q.change_rate) {
            if rate > Decimal::ZERO {
                advancers += 1;
            } else if rate < Decimal::ZERO {
                decliners += 1;
            } else {
                unchanged += 1;
            }
        }

        let rated = || quotes.iter().filter_map(|q| q.change_rate.map(|r| (r, &q.code)));
        let top_gainer = rated()
            .filter(|(r, _)| *r > Decimal::ZERO)
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, code)| code.clone());
        let top_loser = rated()
            .filter(|(r, _)| *r < Decimal::ZERO)
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, code)| code.clone());

        Self {
            market: market.into(),
            updated_at: Utc::now(),
            advancers,
            decliners,
            unchanged,
            top_gainer,
            top_loser,
            quotes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(code: &str, rate: Option<Decimal>) -> QuoteRecord {
        QuoteRecord {
            code: code.to_string(),
            name: None,
            last_price: None,
            open_price: None,
            high_price: None,
            low_price: None,
            prev_close_price: None,
            volume: None,
            turnover: None,
            change_val: None,
            change_rate: rate,
            update_time: None,
            status: None,
        }
    }

    #[test]
    fn test_qualify_code() {
        assert_eq!(qualify_code("aapl", Market::Us), "US.AAPL");
        assert_eq!(qualify_code("00700", Market::Hk), "HK.00700");
        assert_eq!(qualify_code("hk.00700", Market::Us), "HK.00700");
        assert_eq!(qualify_code(" US.tsla ", Market::Hk), "US.TSLA");
        // Unknown prefixes are not treated as markets
        assert_eq!(qualify_code("BRK.B", Market::Us), "US.BRK.B");
    }

    #[test]
    fn test_market_parsing() {
        assert_eq!("cn-sh".parse::<Market>(), Ok(Market::Sh));
        assert_eq!("CN-SZ".parse::<Market>(), Ok(Market::Sz));
        assert_eq!(Market::of_code("SZ.000001"), Some(Market::Sz));
        assert_eq!(Market::of_code("AAPL"), None);
        assert!("LSE".parse::<Market>().is_err());
    }

    #[test]
    fn test_kline_period_aliases() {
        assert_eq!("5min".parse::<KlinePeriod>(), Ok(KlinePeriod::Min5));
        assert_eq!("DAY".parse::<KlinePeriod>(), Ok(KlinePeriod::Day));
        assert_eq!(KlinePeriod::Month.ktype(), "K_MON");
        assert!("2h".parse::<KlinePeriod>().is_err());
    }

    #[test]
    fn test_snapshot_breadth() {
        let snapshot = MarketSnapshot::from_quotes(
            "US",
            vec![
                quote("US.SPY", Some(dec!(0.8))),
                quote("US.QQQ", Some(dec!(1.4))),
                quote("US.DIA", Some(dec!(-0.3))),
                quote("US.IWM", None),
            ],
        );
        assert_eq!(snapshot.advancers, 2);
        assert_eq!(snapshot.decliners, 1);
        assert_eq!(snapshot.unchanged, 0);
        assert_eq!(snapshot.top_gainer.as_deref(), Some("US.QQQ"));
        assert_eq!(snapshot.top_loser.as_deref(), Some("US.DIA"));
    }

    #[test]
    fn test_snapshot_all_flat() {
        let snapshot = MarketSnapshot::from_quotes("HK", vec![quote("HK.800000", Some(dec!(0)))]);
        assert_eq!(snapshot.unchanged, 1);
        assert!(snapshot.top_gainer.is_none());
        assert!(snapshot.top_loser.is_none());
    }
}
