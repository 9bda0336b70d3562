//! One function per tool. Each performs exactly one broker query.

use futumcp_core::*;
use serde_json::json;
use tracing::debug;

use crate::config::ConfigurationGateway;
use crate::error::ToolError;
use crate::result::ToolResult;
use crate::session::{BrokerSessionHandle, GatewayLease, SessionUpdate};
use crate::translate::{render, summarize, translate, RecordKind};

pub async fn get_watchlist(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    market: Option<Market>,
    group_name: &str,
) -> Result<ToolResult, ToolError> {
    let table = session
        .run_query(lease, lease.client().query_watchlist(group_name))
        .await?;
    let mut entries: Vec<WatchlistEntry> = translate(&table)?;
    if let Some(market) = market {
        entries.retain(|e| e.market == Some(market));
    }
    Ok(render(&entries, RecordKind::Watchlist)?)
}

pub async fn get_watchlist_groups(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    group_type: WatchlistGroupType,
) -> Result<ToolResult, ToolError> {
    let table = session
        .run_query(lease, lease.client().query_watchlist_groups(group_type))
        .await?;
    let groups: Vec<WatchlistGroup> = translate(&table)?;
    Ok(render(&groups, RecordKind::WatchlistGroup)?)
}

pub async fn get_stock_quote(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    code: String,
) -> Result<ToolResult, ToolError> {
    let codes = [code];
    let table = session
        .run_query(lease, lease.client().query_quote(&codes))
        .await?;
    let quotes: Vec<QuoteRecord> = translate(&table)?;
    Ok(render(&quotes, RecordKind::Quote)?)
}

pub async fn get_stock_history(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    code: &str,
    period: KlinePeriod,
    count: u32,
) -> Result<ToolResult, ToolError> {
    let table = session
        .run_query(lease, lease.client().query_history(code, period, count))
        .await?;
    let mut bars: Vec<HistoryBar> = translate(&table)?;

    // Oldest first, then keep the most recent `count`.
    bars.sort_by(|a, b| a.time_key.cmp(&b.time_key));
    let excess = bars.len().saturating_sub(count as usize);
    bars.drain(..excess);

    debug!(code, period = period.as_str(), bars = bars.len(), "History translated");
    Ok(render(&bars, RecordKind::History)?)
}

fn symbol(code: &str) -> &str {
    match code.split_once('.') {
        Some((prefix, rest)) if prefix.parse::<Market>().is_ok() => rest,
        _ => code,
    }
}

/// Lower is better: exact symbol, symbol prefix, anything else.
fn match_rank(m: &StockMatch, keyword: &str) -> u8 {
    let sym = symbol(&m.code).to_ascii_uppercase();
    if sym == keyword {
        0
    } else if sym.starts_with(keyword) {
        1
    } else {
        2
    }
}

pub async fn search_stock(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    keyword: &str,
    markets: &[Market],
    limit: usize,
) -> Result<ToolResult, ToolError> {
    let table = session
        .run_query(lease, lease.client().query_stock_list(markets))
        .await?;
    let keyword = keyword.to_uppercase();

    let mut matches: Vec<StockMatch> = translate::<StockMatch>(&table)?
        .into_iter()
        .filter(|m| m.market.is_some_and(|market| markets.contains(&market)))
        .filter(|m| {
            m.code.to_uppercase().contains(&keyword)
                || m.name
                    .as_deref()
                    .is_some_and(|n| n.to_uppercase().contains(&keyword))
        })
        .collect();
    matches.sort_by_key(|m| match_rank(m, &keyword));
    matches.truncate(limit);

    Ok(render(&matches, RecordKind::Stock)?)
}

pub async fn get_market_snapshot(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    region: SnapshotRegion,
    codes: Option<Vec<String>>,
) -> Result<ToolResult, ToolError> {
    let (label, codes) = match codes {
        Some(codes) => ("CUSTOM", codes),
        None => (
            region.as_str(),
            region.index_codes().iter().map(|c| c.to_string()).collect(),
        ),
    };
    let table = session
        .run_query(lease, lease.client().query_quote(&codes))
        .await?;
    let quotes: Vec<QuoteRecord> = translate(&table)?;
    let snapshot = MarketSnapshot::from_quotes(label, quotes);

    let mut summary = summarize(std::slice::from_ref(&snapshot), RecordKind::Snapshot);
    summary.push('\n');
    summary.push_str(&summarize(&snapshot.quotes, RecordKind::Quote));
    let payload = serde_json::to_value(&snapshot)
        .map_err(|e| ToolError::Internal(format!("could not serialize snapshot: {}", e)))?;
    Ok(ToolResult::success(summary, payload))
}

pub async fn get_account_info(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    mode: Option<AccountMode>,
) -> Result<ToolResult, ToolError> {
    let mode = mode.unwrap_or(lease.account_mode());
    let table = session
        .run_query(lease, lease.client().query_account(mode))
        .await?;
    let mut accounts: Vec<AccountSnapshot> = translate(&table)?;
    for account in &mut accounts {
        account.account_type = mode;
    }
    Ok(render(&accounts, RecordKind::Account)?)
}

pub async fn get_positions(
    session: &BrokerSessionHandle,
    lease: &GatewayLease,
    mode: Option<AccountMode>,
) -> Result<ToolResult, ToolError> {
    let mode = mode.unwrap_or(lease.account_mode());
    let table = session
        .run_query(lease, lease.client().query_positions(mode))
        .await?;
    let positions: Vec<PositionRecord> = translate(&table)?;
    Ok(render(&positions, RecordKind::Position)?)
}

pub async fn configure_futu_client(
    config: &ConfigurationGateway,
    update: SessionUpdate,
) -> Result<ToolResult, ToolError> {
    let status = config.set(update).await?;
    let summary = format!(
        "Futu client configuration updated:\n  host: {}\n  port: {}\n  unlock password: {}\n  account mode: {}\nThe connection is re-established on the next query.",
        status.host, status.port, status.unlock_password, status.account_mode
    );
    Ok(ToolResult::success(summary, json!(status)))
}

pub async fn get_client_status(config: &ConfigurationGateway) -> Result<ToolResult, ToolError> {
    let status = config.get().await;
    Ok(ToolResult::success(status.to_string(), json!(status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    /// Replies to history queries with five daily bars, newest first,
    /// whatever count was asked for.
    struct NewestFirstClient;

    #[async_trait]
    impl BrokerClient for NewestFirstClient {
        async fn connect(&self, _: &Endpoint) -> Result<ServerInfo, GatewayError> {
            Ok(ServerInfo {
                server_version: "9.0".into(),
                connection_id: None,
            })
        }
        async fn query_quote(&self, _: &[String]) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_history(&self, code: &str, _: KlinePeriod, _: u32) -> Result<Table, GatewayError> {
            let mut table = Table::new(["code", "time_key", "close"]);
            for day in (1..=5).rev() {
                table.push_row(vec![
                    json!(code),
                    json!(format!("2024-06-0{} 00:00:00", day)),
                    json!(100 + day),
                ]);
            }
            Ok(table)
        }
        async fn query_watchlist(&self, _: &str) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_watchlist_groups(&self, _: WatchlistGroupType) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_stock_list(&self, _: &[Market]) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_positions(&self, _: AccountMode) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_account(&self, _: AccountMode) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn unlock_trade(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn stock(code: &str) -> StockMatch {
        StockMatch {
            code: code.to_string(),
            name: None,
            market: Market::of_code(code),
            security_type: None,
            listing_status: None,
        }
    }

    #[test]
    fn test_symbol_strips_market_prefix() {
        assert_eq!(symbol("US.TSLA"), "TSLA");
        assert_eq!(symbol("US.BRK.B"), "BRK.B");
        assert_eq!(symbol("TSLA"), "TSLA");
    }

    #[test]
    fn test_match_rank() {
        assert_eq!(match_rank(&stock("US.TSLA"), "TSLA"), 0);
        assert_eq!(match_rank(&stock("US.TSLL"), "TSL"), 1);
        assert_eq!(match_rank(&stock("US.TSDD"), "TSLA"), 2);
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_bars_oldest_first() {
        let session = BrokerSessionHandle::new(Arc::new(NewestFirstClient), SessionSettings::default());
        let lease = session.ensure_connected().await.unwrap();

        let result = get_stock_history(&session, &lease, "HK.00700", KlinePeriod::Day, 3)
            .await
            .unwrap();
        let bars = result.payload().unwrap().as_array().unwrap();
        let keys: Vec<&str> = bars.iter().filter_map(|b| b["time_key"].as_str()).collect();
        assert_eq!(
            keys,
            vec!["2024-06-03 00:00:00", "2024-06-04 00:00:00", "2024-06-05 00:00:00"]
        );
        assert_eq!(bars[2]["close"], Value::String("105".into()));
    }
}
