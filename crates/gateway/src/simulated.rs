use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use futumcp_core::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Configuration for the simulated gateway.
#[derive(Debug, Clone)]
pub struct SimulatedGatewayConfig {
    /// Password accepted by `unlock_trade`.
    pub unlock_password: Option<String>,
    /// Artificial latency added to every call.
    pub latency: Duration,
}

impl Default for SimulatedGatewayConfig {
    fn default() -> Self {
        Self {
            unlock_password: Some("123456".to_string()),
            latency: Duration::ZERO,
        }
    }
}

/// A listed security known to the simulator.
#[derive(Debug, Clone)]
struct Security {
    code: String,
    name: String,
    security_type: &'static str,
    lot_size: i64,
    last_price: Decimal,
    prev_close: Decimal,
    volume: i64,
}

#[derive(Debug, Clone)]
struct Holding {
    code: String,
    qty: Decimal,
    cost_price: Decimal,
}

#[derive(Debug)]
struct SimState {
    reachable: bool,
    connected_to: Option<Endpoint>,
    unlocked: bool,
    connects: Vec<Endpoint>,
    unlock_attempts: usize,
    queries: usize,
    fail_next: Option<GatewayError>,
    securities: Vec<Security>,
    watchlists: HashMap<String, Vec<String>>,
    holdings: HashMap<AccountMode, Vec<Holding>>,
    cash: HashMap<AccountMode, Decimal>,
}

/// An in-memory gateway for demos and tests.
///
/// Serves a small fixed universe of US, HK and A-share securities, a couple of
/// watchlist groups, and one real plus one simulated account. Connection
/// failures and query errors can be injected.
pub struct SimulatedGateway {
    config: SimulatedGatewayConfig,
    state: Mutex<SimState>,
}

fn security(
    code: &str,
    name: &str,
    security_type: &'static str,
    lot_size: i64,
    last_price: Decimal,
    prev_close: Decimal,
    volume: i64,
) -> Security {
    Security {
        code: code.to_string(),
        name: name.to_string(),
        security_type,
        lot_size,
        last_price,
        prev_close,
        volume,
    }
}

fn default_universe() -> Vec<Security> {
    vec![
        security("US.AAPL", "Apple Inc", "STOCK", 1, Decimal::new(19234, 2), Decimal::new(19006, 2), 48_210_300),
        security("US.MSFT", "Microsoft Corp", "STOCK", 1, Decimal::new(41522, 2), Decimal::new(41810, 2), 19_880_120),
        security("US.NVDA", "NVIDIA Corp", "STOCK", 1, Decimal::new(12188, 2), Decimal::new(11870, 2), 251_004_700),
        security("US.TSLA", "Tesla Inc", "STOCK", 1, Decimal::new(24850, 2), Decimal::new(25120, 2), 97_450_000),
        security("US.TSLL", "Direxion Daily TSLA Bull 2X Shares", "ETF", 1, Decimal::new(1412, 2), Decimal::new(1443, 2), 61_200_000),
        security("US.TSLQ", "AXS TSLA Bear Daily ETF", "ETF", 1, Decimal::new(3077, 2), Decimal::new(3010, 2), 3_900_000),
        security("US.TSLY", "YieldMax TSLA Option Income Strategy ETF", "ETF", 1, Decimal::new(1096, 2), Decimal::new(1101, 2), 4_120_000),
        security("US.TSLZ", "T-Rex 2X Inverse TSLA Daily Target ETF", "ETF", 1, Decimal::new(515, 2), Decimal::new(502, 2), 2_800_000),
        security("US.TSDD", "GraniteShares 2x Short TSLA Daily ETF", "ETF", 1, Decimal::new(2145, 2), Decimal::new(2096, 2), 1_700_000),
        security("US.SPY", "SPDR S&P 500 ETF Trust", "ETF", 1, Decimal::new(54210, 2), Decimal::new(53988, 2), 52_400_000),
        security("US.QQQ", "Invesco QQQ Trust", "ETF", 1, Decimal::new(46877, 2), Decimal::new(46512, 2), 38_100_000),
        security("US.DIA", "SPDR Dow Jones Industrial Average ETF", "ETF", 1, Decimal::new(39804, 2), Decimal::new(39911, 2), 3_200_000),
        security("HK.00700", "Tencent Holdings", "STOCK", 100, Decimal::new(3846, 1), Decimal::new(3790, 1), 17_520_000),
        security("HK.09988", "Alibaba Group", "STOCK", 100, Decimal::new(8245, 2), Decimal::new(8310, 2), 41_300_000),
        security("HK.01211", "BYD Company", "STOCK", 500, Decimal::new(2472, 1), Decimal::new(2431, 1), 8_900_000),
        security("HK.800000", "Hang Seng Index", "IDX", 1, Decimal::new(1782411, 2), Decimal::new(1775820, 2), 0),
        security("HK.800700", "Hang Seng TECH Index", "IDX", 1, Decimal::new(381245, 2), Decimal::new(384902, 2), 0),
        security("SH.600519", "Kweichow Moutai", "STOCK", 100, Decimal::new(147800, 2), Decimal::new(148950, 2), 2_310_000),
        security("SH.000001", "SSE Composite Index", "IDX", 1, Decimal::new(298763, 2), Decimal::new(297104, 2), 0),
        security("SZ.000858", "Wuliangye Yibin", "STOCK", 100, Decimal::new(13502, 2), Decimal::new(13377, 2), 11_800_000),
        security("SZ.399001", "SZSE Component Index", "IDX", 1, Decimal::new(918455, 2), Decimal::new(921330, 2), 0),
    ]
}

fn default_watchlists() -> HashMap<String, Vec<String>> {
    let mut lists = HashMap::new();
    lists.insert(
        "Starred".to_string(),
        vec!["US.AAPL".to_string(), "HK.00700".to_string()],
    );
    lists.insert(
        "Tech".to_string(),
        vec!["US.MSFT".to_string(), "US.NVDA".to_string(), "HK.09988".to_string()],
    );
    lists
}

fn default_holdings() -> HashMap<AccountMode, Vec<Holding>> {
    let mut holdings = HashMap::new();
    holdings.insert(
        AccountMode::Simulate,
        vec![
            Holding {
                code: "US.AAPL".to_string(),
                qty: Decimal::new(50, 0),
                cost_price: Decimal::new(17520, 2),
            },
            Holding {
                code: "US.TSLA".to_string(),
                qty: Decimal::new(20, 0),
                cost_price: Decimal::new(26410, 2),
            },
        ],
    );
    holdings.insert(
        AccountMode::Real,
        vec![Holding {
            code: "HK.00700".to_string(),
            qty: Decimal::new(200, 0),
            cost_price: Decimal::new(3512, 1),
        }],
    );
    holdings
}

impl SimulatedGateway {
    pub fn new(config: SimulatedGatewayConfig) -> Self {
        let mut cash = HashMap::new();
        cash.insert(AccountMode::Simulate, Decimal::new(1_000_000, 0));
        cash.insert(AccountMode::Real, Decimal::new(25_000, 0));

        Self {
            config,
            state: Mutex::new(SimState {
                reachable: true,
                connected_to: None,
                unlocked: false,
                connects: Vec::new(),
                unlock_attempts: 0,
                queries: 0,
                fail_next: None,
                securities: default_universe(),
                watchlists: default_watchlists(),
                holdings: default_holdings(),
                cash,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent connect attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state();
        state.reachable = reachable;
        if !reachable {
            state.connected_to = None;
            state.unlocked = false;
        }
    }

    /// Fail the next query with `error`.
    pub fn fail_next_query(&self, error: GatewayError) {
        self.state().fail_next = Some(error);
    }

    /// Every endpoint `connect` was called with, in order.
    pub fn connect_history(&self) -> Vec<Endpoint> {
        self.state().connects.clone()
    }

    pub fn unlock_attempts(&self) -> usize {
        self.state().unlock_attempts
    }

    /// Number of data queries served.
    pub fn query_count(&self) -> usize {
        self.state().queries
    }

    async fn delay(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    /// Common preamble of every query.
    fn begin_query(&self, trading: bool) -> Result<MutexGuard<'_, SimState>, GatewayError> {
        let mut state = self.state();
        if state.connected_to.is_none() {
            return Err(GatewayError::Disconnected("not connected".to_string()));
        }
        if let Some(error) = state.fail_next.take() {
            if error.is_transport() {
                state.connected_to = None;
                state.unlocked = false;
            }
            return Err(error);
        }
        if trading && !state.unlocked {
            return Err(GatewayError::Rejected(
                "trading is locked, unlock_trade first".to_string(),
            ));
        }
        state.queries += 1;
        Ok(state)
    }

    fn find<'a>(state: &'a SimState, code: &str) -> Option<&'a Security> {
        state.securities.iter().find(|s| s.code == code)
    }
}

fn change_val(sec: &Security) -> Option<Decimal> {
    sec.last_price.checked_sub(sec.prev_close)
}

fn change_rate(sec: &Security) -> Option<Decimal> {
    if sec.prev_close.is_zero() {
        return Some(Decimal::ZERO);
    }
    let rate = change_val(sec)?
        .checked_div(sec.prev_close)?
        .checked_mul(Decimal::ONE_HUNDRED)?;
    Some(rate.round_dp(2))
}

fn market_label(code: &str) -> Value {
    Market::of_code(code).map_or(Value::Null, |m| json!(m.prefix()))
}

/// Deterministic price path ending at the security's last price.
fn synthetic_bars(sec: &Security, period: KlinePeriod, count: u32) -> Table {
    let mut table = Table::new([
        "code", "time_key", "open", "close", "high", "low", "volume", "turnover", "change_rate",
    ]);
    let last = sec.last_price.to_f64().unwrap_or(100.0);
    let end = NaiveDate::from_ymd_opt(2024, 6, 28)
        .and_then(|d| d.and_hms_opt(16, 0, 0))
        .unwrap_or(NaiveDateTime::MIN);

    let mut prev_close: Option<f64> = None;
    for i in 0..count {
        let steps_back = i64::from(count - 1 - i);
        let wobble = ((i as f64) * 0.7).sin() * 0.02 + (steps_back as f64) * -0.001;
        let close = (last * (1.0 + wobble)).max(0.01);
        let open = prev_close.unwrap_or(close * 0.995);
        let high = open.max(close) * 1.006;
        let low = open.min(close) * 0.994;
        let volume = sec.volume / 10 + i64::from(i) * 1_000;
        let rate = prev_close.map_or(0.0, |p| (close - p) / p * 100.0);
        let ts = end - ChronoDuration::minutes(period.minutes() * steps_back);

        table.push_row(vec![
            json!(sec.code),
            json!(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            json!(round2(open)),
            json!(round2(close)),
            json!(round2(high)),
            json!(round2(low)),
            json!(volume),
            json!(round2(close * volume as f64)),
            json!(round2(rate)),
        ]);
        prev_close = Some(close);
    }
    table
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait]
impl BrokerClient for SimulatedGateway {
    async fn connect(&self, endpoint: &Endpoint) -> Result<ServerInfo, GatewayError> {
        self.delay().await;
        let mut state = self.state();
        state.connects.push(endpoint.clone());
        if !state.reachable {
            return Err(GatewayError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.connected_to = Some(endpoint.clone());
        state.unlocked = false;
        debug!(%endpoint, "Simulated gateway connected");
        Ok(ServerInfo {
            server_version: "sim-1.0".to_string(),
            connection_id: Some(format!("sim-{}", state.connects.len())),
        })
    }

    async fn query_quote(&self, codes: &[String]) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(false)?;
        let mut table = Table::new([
            "code",
            "stock_name",
            "last_price",
            "open_price",
            "high_price",
            "low_price",
            "prev_close_price",
            "volume",
            "turnover",
            "change_val",
            "change_rate",
            "update_time",
            "sec_status",
        ]);
        for code in codes {
            let Some(sec) = Self::find(&state, code) else {
                return Err(GatewayError::Rejected(format!("unknown stock {}", code)));
            };
            table.push_row(vec![
                json!(sec.code),
                json!(sec.name),
                json!(sec.last_price),
                json!(sec.prev_close),
                json!(sec.last_price.max(sec.prev_close)),
                json!(sec.last_price.min(sec.prev_close)),
                json!(sec.prev_close),
                json!(sec.volume),
                json!(sec.last_price * Decimal::from(sec.volume)),
                json!(change_val(sec)),
                json!(change_rate(sec)),
                json!("2024-06-28 16:00:00"),
                json!("NORMAL"),
            ]);
        }
        Ok(table)
    }

    async fn query_history(
        &self,
        code: &str,
        period: KlinePeriod,
        max_count: u32,
    ) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(false)?;
        let sec = Self::find(&state, code)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown stock {}", code)))?;
        Ok(synthetic_bars(sec, period, max_count.min(1000)))
    }

    async fn query_watchlist(&self, group_name: &str) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(false)?;
        let codes: Vec<String> = if group_name.eq_ignore_ascii_case("all") {
            let mut all: Vec<String> = state.watchlists.values().flatten().cloned().collect();
            all.sort();
            all.dedup();
            all
        } else {
            state
                .watchlists
                .get(group_name)
                .cloned()
                .ok_or_else(|| GatewayError::Rejected(format!("unknown group {}", group_name)))?
        };

        let mut table = Table::new(["code", "name", "market", "stock_type", "lot_size", "listing_date"]);
        for code in codes {
            if let Some(sec) = Self::find(&state, &code) {
                table.push_row(vec![
                    json!(sec.code),
                    json!(sec.name),
                    market_label(&sec.code),
                    json!(sec.security_type),
                    json!(sec.lot_size),
                    Value::Null,
                ]);
            }
        }
        Ok(table)
    }

    async fn query_watchlist_groups(
        &self,
        group_type: WatchlistGroupType,
    ) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(false)?;
        let mut table = Table::new(["group_name", "group_type"]);
        if group_type != WatchlistGroupType::Custom {
            table.push_row(vec![json!("All"), json!("SYSTEM")]);
        }
        let mut names: Vec<&String> = state.watchlists.keys().collect();
        names.sort();
        for name in names {
            let kind = if name == "Starred" { "SYSTEM" } else { "CUSTOM" };
            if group_type == WatchlistGroupType::All || group_type.as_str() == kind {
                table.push_row(vec![json!(name), json!(kind)]);
            }
        }
        Ok(table)
    }

    async fn query_stock_list(&self, markets: &[Market]) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(false)?;
        let mut table = Table::new(["code", "name", "market", "stock_type", "listing_status"]);
        for sec in &state.securities {
            let market = Market::of_code(&sec.code);
            if market.is_some_and(|m| markets.contains(&m)) {
                table.push_row(vec![
                    json!(sec.code),
                    json!(sec.name),
                    market_label(&sec.code),
                    json!(sec.security_type),
                    json!("LISTED"),
                ]);
            }
        }
        Ok(table)
    }

    async fn query_positions(&self, mode: AccountMode) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(true)?;
        let mut table = Table::new([
            "code",
            "stock_name",
            "qty",
            "can_sell_qty",
            "cost_price",
            "nominal_price",
            "market_val",
            "pl_val",
            "pl_ratio",
            "position_side",
        ]);
        for holding in state.holdings.get(&mode).into_iter().flatten() {
            let Some(sec) = Self::find(&state, &holding.code) else { continue };
            let market_val = sec.last_price * holding.qty;
            let pl_val = (sec.last_price - holding.cost_price) * holding.qty;
            let pl_ratio = if holding.cost_price.is_zero() {
                Value::String("N/A".to_string())
            } else {
                json!(((sec.last_price - holding.cost_price) / holding.cost_price
                    * Decimal::ONE_HUNDRED)
                    .round_dp(2))
            };
            table.push_row(vec![
                json!(sec.code),
                json!(sec.name),
                json!(holding.qty),
                json!(holding.qty),
                json!(holding.cost_price),
                json!(sec.last_price),
                json!(market_val),
                json!(pl_val),
                pl_ratio,
                json!("LONG"),
            ]);
        }
        Ok(table)
    }

    async fn query_account(&self, mode: AccountMode) -> Result<Table, GatewayError> {
        self.delay().await;
        let state = self.begin_query(true)?;
        let market_val: Decimal = state
            .holdings
            .get(&mode)
            .into_iter()
            .flatten()
            .filter_map(|h| Self::find(&state, &h.code).map(|s| s.last_price * h.qty))
            .sum();
        let cash = state.cash.get(&mode).copied().unwrap_or(Decimal::ZERO);
        let acc_id = match mode {
            AccountMode::Real => "281756479345015",
            AccountMode::Simulate => "8851203",
        };
        Ok(Table::new([
            "acc_id",
            "trd_env",
            "currency",
            "total_assets",
            "cash",
            "market_val",
            "avl_withdrawal_cash",
            "power",
        ])
        .with_row(vec![
            json!(acc_id),
            json!(mode.as_str()),
            json!("USD"),
            json!(cash + market_val),
            json!(cash),
            json!(market_val),
            json!(cash),
            json!(cash * Decimal::TWO),
        ]))
    }

    async fn unlock_trade(&self, password: &str) -> Result<(), GatewayError> {
        self.delay().await;
        let mut state = self.state();
        if state.connected_to.is_none() {
            return Err(GatewayError::Disconnected("not connected".to_string()));
        }
        state.unlock_attempts += 1;
        match self.config.unlock_password.as_deref() {
            Some(expected) if expected == password => {
                state.unlocked = true;
                Ok(())
            }
            _ => Err(GatewayError::Rejected("unlock password incorrect".to_string())),
        }
    }

    async fn close(&self) {
        let mut state = self.state();
        state.connected_to = None;
        state.unlocked = false;
    }
}
