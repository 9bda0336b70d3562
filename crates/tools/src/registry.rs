use futumcp_core::*;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::ToolError;
use crate::session::SessionUpdate;

/// The fixed set of tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolId {
    GetWatchlist,
    GetWatchlistGroups,
    GetStockQuote,
    GetStockHistory,
    SearchStock,
    GetMarketSnapshot,
    GetAccountInfo,
    GetPositions,
    ConfigureFutuClient,
    GetClientStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer { min: i64, max: i64 },
    Enum(&'static [&'static str]),
    StringList { max_items: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDefault {
    None,
    Str(&'static str),
    Int(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub default: ArgDefault,
    pub description: &'static str,
}

const fn arg(name: &'static str, kind: ArgKind, description: &'static str) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required: false,
        default: ArgDefault::None,
        description,
    }
}

impl ArgSpec {
    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    const fn default_str(mut self, value: &'static str) -> Self {
        self.default = ArgDefault::Str(value);
        self
    }

    const fn default_int(mut self, value: i64) -> Self {
        self.default = ArgDefault::Int(value);
        self
    }
}

const QUOTE_MARKETS: &[&str] = &["US", "HK", "SH", "SZ"];
const WATCHLIST_MARKETS: &[&str] = &["US", "HK", "CN-SH", "CN-SZ"];
const SEARCH_MARKETS: &[&str] = &["US", "HK", "SH", "SZ", "ALL"];
const SNAPSHOT_MARKETS: &[&str] = &["US", "HK", "CN"];
const PERIODS: &[&str] = &["1m", "5m", "15m", "30m", "60m", "day", "week", "month"];
const ACCOUNT_MODES: &[&str] = &["REAL", "SIMULATE"];
const GROUP_TYPES: &[&str] = &["ALL", "SYSTEM", "CUSTOM"];

pub const MAX_HISTORY_COUNT: i64 = 1000;
pub const MAX_SEARCH_LIMIT: i64 = 200;
pub const MAX_SNAPSHOT_CODES: usize = 400;

const WATCHLIST_ARGS: &[ArgSpec] = &[
    arg("market", ArgKind::Enum(WATCHLIST_MARKETS), "Only return securities of this market"),
    arg("group_name", ArgKind::String, "Watchlist group to read").default_str("All"),
];

const WATCHLIST_GROUP_ARGS: &[ArgSpec] = &[arg(
    "group_type",
    ArgKind::Enum(GROUP_TYPES),
    "Which kind of groups to list",
)
.default_str("ALL")];

const QUOTE_ARGS: &[ArgSpec] = &[
    arg("stock_code", ArgKind::String, "Stock code, e.g. AAPL or US.AAPL").required(),
    arg("market", ArgKind::Enum(QUOTE_MARKETS), "Market used when the code has no prefix")
        .default_str("US"),
];

const HISTORY_ARGS: &[ArgSpec] = &[
    arg("stock_code", ArgKind::String, "Stock code, e.g. AAPL or HK.00700").required(),
    arg("period", ArgKind::Enum(PERIODS), "Candlestick period").default_str("day"),
    arg(
        "count",
        ArgKind::Integer {
            min: 1,
            max: MAX_HISTORY_COUNT,
        },
        "Number of most recent bars",
    )
    .default_int(30),
    arg("market", ArgKind::Enum(QUOTE_MARKETS), "Market used when the code has no prefix")
        .default_str("US"),
];

const SEARCH_ARGS: &[ArgSpec] = &[
    arg("keyword", ArgKind::String, "Part of a stock code or name").required(),
    arg("market", ArgKind::Enum(SEARCH_MARKETS), "Market to search").default_str("ALL"),
    arg(
        "limit",
        ArgKind::Integer {
            min: 1,
            max: MAX_SEARCH_LIMIT,
        },
        "Maximum number of matches",
    )
    .default_int(10),
];

const SNAPSHOT_ARGS: &[ArgSpec] = &[
    arg("market", ArgKind::Enum(SNAPSHOT_MARKETS), "Market whose benchmarks are quoted")
        .default_str("US"),
    arg(
        "code_list",
        ArgKind::StringList {
            max_items: MAX_SNAPSHOT_CODES,
        },
        "Explicit codes to snapshot instead of the market benchmarks",
    ),
];

const ACCOUNT_ARGS: &[ArgSpec] = &[arg(
    "account_type",
    ArgKind::Enum(ACCOUNT_MODES),
    "Trading environment, defaults to the configured account mode",
)];

const CONFIGURE_ARGS: &[ArgSpec] = &[
    arg("host", ArgKind::String, "OpenD host").required(),
    arg("port", ArgKind::Integer { min: 1, max: 65535 }, "OpenD port").required(),
    arg("unlock_pwd", ArgKind::String, "Trade unlock password, omit to clear"),
    arg("account_mode", ArgKind::Enum(ACCOUNT_MODES), "Default trading environment"),
];

impl ToolId {
    pub const ALL: [ToolId; 10] = [
        ToolId::GetWatchlist,
        ToolId::GetWatchlistGroups,
        ToolId::GetStockQuote,
        ToolId::GetStockHistory,
        ToolId::SearchStock,
        ToolId::GetMarketSnapshot,
        ToolId::GetAccountInfo,
        ToolId::GetPositions,
        ToolId::ConfigureFutuClient,
        ToolId::GetClientStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolId::GetWatchlist => "get_watchlist",
            ToolId::GetWatchlistGroups => "get_watchlist_groups",
            ToolId::GetStockQuote => "get_stock_quote",
            ToolId::GetStockHistory => "get_stock_history",
            ToolId::SearchStock => "search_stock",
            ToolId::GetMarketSnapshot => "get_market_snapshot",
            ToolId::GetAccountInfo => "get_account_info",
            ToolId::GetPositions => "get_positions",
            ToolId::ConfigureFutuClient => "configure_futu_client",
            ToolId::GetClientStatus => "get_client_status",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolId::GetWatchlist => "Get the securities in one of the user's watchlist groups.",
            ToolId::GetWatchlistGroups => "List the user's watchlist groups.",
            ToolId::GetStockQuote => "Get a real-time quote for one stock.",
            ToolId::GetStockHistory => {
                "Get historical candlesticks for a stock, oldest first."
            }
            ToolId::SearchStock => "Search listed stocks by code or name.",
            ToolId::GetMarketSnapshot => {
                "Get benchmark quotes and market breadth (advancers, decliners, top movers)."
            }
            ToolId::GetAccountInfo => "Get account funds. Requires a trade unlock password.",
            ToolId::GetPositions => "Get open positions. Requires a trade unlock password.",
            ToolId::ConfigureFutuClient => {
                "Change the OpenD connection settings. Takes effect on the next query."
            }
            ToolId::GetClientStatus => "Show the connection status of the Futu client.",
        }
    }

    /// Trading-level tools need an unlocked connection.
    pub fn requires_unlock(&self) -> bool {
        matches!(self, ToolId::GetAccountInfo | ToolId::GetPositions)
    }

    /// Tools that only touch the session, never the gateway.
    pub fn is_local(&self) -> bool {
        matches!(self, ToolId::ConfigureFutuClient | ToolId::GetClientStatus)
    }

    pub fn args(&self) -> &'static [ArgSpec] {
        match self {
            ToolId::GetWatchlist => WATCHLIST_ARGS,
            ToolId::GetWatchlistGroups => WATCHLIST_GROUP_ARGS,
            ToolId::GetStockQuote => QUOTE_ARGS,
            ToolId::GetStockHistory => HISTORY_ARGS,
            ToolId::SearchStock => SEARCH_ARGS,
            ToolId::GetMarketSnapshot => SNAPSHOT_ARGS,
            ToolId::GetAccountInfo | ToolId::GetPositions => ACCOUNT_ARGS,
            ToolId::ConfigureFutuClient => CONFIGURE_ARGS,
            ToolId::GetClientStatus => &[],
        }
    }

    /// JSON schema of the tool's arguments.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for spec in self.args() {
            let mut prop = match spec.kind {
                ArgKind::String => json!({"type": "string"}),
                ArgKind::Integer { min, max } => {
                    json!({"type": "integer", "minimum": min, "maximum": max})
                }
                ArgKind::Enum(choices) => json!({"type": "string", "enum": choices}),
                ArgKind::StringList { max_items } => {
                    json!({"type": "array", "items": {"type": "string"}, "maxItems": max_items})
                }
            };
            prop["description"] = json!(spec.description);
            match spec.default {
                ArgDefault::Str(s) => prop["default"] = json!(s),
                ArgDefault::Int(i) => prop["default"] = json!(i),
                ArgDefault::None => {}
            }
            if spec.required {
                required.push(spec.name);
            }
            properties.insert(spec.name.to_string(), prop);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            requires_unlock: self.requires_unlock(),
        }
    }
}

/// What a client sees in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip)]
    pub requires_unlock: bool,
}

/// Name lookup built once at startup.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    by_name: HashMap<&'static str, ToolId>,
    definitions: Vec<ToolDefinition>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            by_name: ToolId::ALL.iter().map(|id| (id.name(), *id)).collect(),
            definitions: ToolId::ALL.iter().map(ToolId::definition).collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<ToolId, ToolError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum ArgValue {
    Str(String),
    Int(i64),
    List(Vec<String>),
}

/// Arguments that passed the schema, with defaults applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: HashMap<&'static str, ArgValue>,
}

impl Arguments {
    fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ArgValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn list(&self, name: &str) -> Option<&[String]> {
        match self.values.get(name)? {
            ArgValue::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    fn parsed<T: FromStr>(&self, name: &str) -> Result<Option<T>, ToolError>
    where
        T::Err: std::fmt::Display,
    {
        self.str(name)
            .map(|s| s.parse::<T>().map_err(|e| ToolError::validation(name, e.to_string())))
            .transpose()
    }

    fn required_str(&self, name: &str) -> Result<&str, ToolError> {
        self.str(name)
            .ok_or_else(|| ToolError::validation(name, "is required"))
    }
}

fn check_value(spec: &ArgSpec, value: &Value) -> Result<ArgValue, ToolError> {
    let field = spec.name;
    match spec.kind {
        ArgKind::String => {
            let s = value
                .as_str()
                .ok_or_else(|| ToolError::validation(field, "must be a string"))?;
            Ok(ArgValue::Str(s.to_string()))
        }
        ArgKind::Integer { min, max } => {
            let n = value
                .as_i64()
                .or_else(|| {
                    value
                        .as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .ok_or_else(|| ToolError::validation(field, "must be an integer"))?;
            if n < min || n > max {
                return Err(ToolError::validation(
                    field,
                    format!("must be between {} and {}, got {}", min, max, n),
                ));
            }
            Ok(ArgValue::Int(n))
        }
        ArgKind::Enum(choices) => {
            let s = value
                .as_str()
                .ok_or_else(|| ToolError::validation(field, "must be a string"))?;
            choices
                .iter()
                .find(|c| c.eq_ignore_ascii_case(s.trim()))
                .map(|c| ArgValue::Str(c.to_string()))
                .ok_or_else(|| {
                    ToolError::validation(
                        field,
                        format!("'{}' is not one of {}", s, choices.join(", ")),
                    )
                })
        }
        ArgKind::StringList { max_items } => {
            let items = value
                .as_array()
                .ok_or_else(|| ToolError::validation(field, "must be an array of strings"))?;
            if items.len() > max_items {
                return Err(ToolError::validation(
                    field,
                    format!("at most {} items allowed, got {}", max_items, items.len()),
                ));
            }
            items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            ToolError::validation(field, "items must be non-empty strings")
                        })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ArgValue::List)
        }
    }
}

/// Check `arguments` against the tool's schema and fill in defaults.
///
/// `null` values count as absent.
pub fn validate(tool: ToolId, arguments: &Value) -> Result<Arguments, ToolError> {
    let empty = Map::new();
    let object = match arguments {
        Value::Null => &empty,
        Value::Object(map) => map,
        _ => return Err(ToolError::validation("arguments", "must be an object")),
    };

    let specs = tool.args();
    if let Some(unknown) = object.keys().find(|k| !specs.iter().any(|s| s.name == k.as_str())) {
        return Err(ToolError::validation(unknown.as_str(), "unknown argument"));
    }

    let mut values = HashMap::new();
    for spec in specs {
        let value = match object.get(spec.name).filter(|v| !v.is_null()) {
            Some(value) => check_value(spec, value)?,
            None => match spec.default {
                ArgDefault::Str(s) => ArgValue::Str(s.to_string()),
                ArgDefault::Int(i) => ArgValue::Int(i),
                ArgDefault::None if spec.required => {
                    return Err(ToolError::validation(spec.name, "is required"))
                }
                ArgDefault::None => continue,
            },
        };
        values.insert(spec.name, value);
    }
    Ok(Arguments { values })
}

// ---------------------------------------------------------------------------
// Typed calls
// ---------------------------------------------------------------------------

/// A validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    GetWatchlist {
        market: Option<Market>,
        group_name: String,
    },
    GetWatchlistGroups {
        group_type: WatchlistGroupType,
    },
    GetStockQuote {
        code: String,
    },
    GetStockHistory {
        code: String,
        period: KlinePeriod,
        count: u32,
    },
    SearchStock {
        keyword: String,
        markets: Vec<Market>,
        limit: usize,
    },
    GetMarketSnapshot {
        region: SnapshotRegion,
        codes: Option<Vec<String>>,
    },
    GetAccountInfo {
        mode: Option<AccountMode>,
    },
    GetPositions {
        mode: Option<AccountMode>,
    },
    ConfigureFutuClient(SessionUpdate),
    GetClientStatus,
}

fn non_empty<'a>(args: &'a Arguments, name: &str) -> Result<&'a str, ToolError> {
    let value = args.required_str(name)?.trim();
    if value.is_empty() {
        return Err(ToolError::validation(name, "must not be empty"));
    }
    Ok(value)
}

fn region_market(region: SnapshotRegion) -> Market {
    match region {
        SnapshotRegion::Us => Market::Us,
        SnapshotRegion::Hk => Market::Hk,
        SnapshotRegion::Cn => Market::Sh,
    }
}

impl ToolCall {
    /// Validate raw JSON arguments and build the typed call.
    pub fn parse(tool: ToolId, arguments: &Value) -> Result<Self, ToolError> {
        let args = validate(tool, arguments)?;
        let call = match tool {
            ToolId::GetWatchlist => ToolCall::GetWatchlist {
                market: args.parsed("market")?,
                group_name: args.required_str("group_name")?.trim().to_string(),
            },
            ToolId::GetWatchlistGroups => ToolCall::GetWatchlistGroups {
                group_type: args.parsed("group_type")?.unwrap_or_default(),
            },
            ToolId::GetStockQuote => {
                let market = args.parsed("market")?.unwrap_or(Market::Us);
                ToolCall::GetStockQuote {
                    code: qualify_code(non_empty(&args, "stock_code")?, market),
                }
            }
            ToolId::GetStockHistory => {
                let market = args.parsed("market")?.unwrap_or(Market::Us);
                let count = args.int("count").unwrap_or(30);
                ToolCall::GetStockHistory {
                    code: qualify_code(non_empty(&args, "stock_code")?, market),
                    period: args.parsed("period")?.unwrap_or(KlinePeriod::Day),
                    count: u32::try_from(count)
                        .map_err(|_| ToolError::validation("count", "out of range"))?,
                }
            }
            ToolId::SearchStock => {
                let markets = match args.required_str("market")? {
                    "ALL" => Market::ALL.to_vec(),
                    other => vec![other
                        .parse::<Market>()
                        .map_err(|e| ToolError::validation("market", e.to_string()))?],
                };
                ToolCall::SearchStock {
                    keyword: non_empty(&args, "keyword")?.to_string(),
                    markets,
                    limit: args.int("limit").unwrap_or(10).max(1) as usize,
                }
            }
            ToolId::GetMarketSnapshot => {
                let region = args.parsed("market")?.unwrap_or(SnapshotRegion::Us);
                let codes = args.list("code_list").filter(|l| !l.is_empty()).map(|l| {
                    l.iter()
                        .map(|c| qualify_code(c, region_market(region)))
                        .collect()
                });
                ToolCall::GetMarketSnapshot { region, codes }
            }
            ToolId::GetAccountInfo => ToolCall::GetAccountInfo {
                mode: args.parsed("account_type")?,
            },
            ToolId::GetPositions => ToolCall::GetPositions {
                mode: args.parsed("account_type")?,
            },
            ToolId::ConfigureFutuClient => {
                let port = args.int("port").unwrap_or(0);
                ToolCall::ConfigureFutuClient(SessionUpdate {
                    host: non_empty(&args, "host")?.to_string(),
                    port: u16::try_from(port)
                        .map_err(|_| ToolError::validation("port", "must be between 1 and 65535"))?,
                    unlock_password: args
                        .str("unlock_pwd")
                        .filter(|p| !p.is_empty())
                        .map(Secret::new),
                    account_mode: args.parsed("account_mode")?,
                })
            }
            ToolId::GetClientStatus => ToolCall::GetClientStatus,
        };
        Ok(call)
    }
}
