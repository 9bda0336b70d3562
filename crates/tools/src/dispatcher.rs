use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConfigurationGateway;
use crate::error::ToolError;
use crate::handlers;
use crate::registry::{ToolCall, ToolDefinition, ToolId, ToolRegistry};
use crate::result::ToolResult;
use crate::session::{BrokerSessionHandle, GatewayLease};

/// Routes tool calls to handlers and normalizes every outcome.
pub struct Dispatcher {
    registry: ToolRegistry,
    session: Arc<BrokerSessionHandle>,
    config: ConfigurationGateway,
}

impl Dispatcher {
    pub fn new(session: Arc<BrokerSessionHandle>) -> Self {
        Self {
            registry: ToolRegistry::new(),
            config: ConfigurationGateway::new(Arc::clone(&session)),
            session,
        }
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        self.registry.definitions()
    }

    pub fn session(&self) -> &Arc<BrokerSessionHandle> {
        &self.session
    }

    /// Run one tool call. Never fails: errors and panics come back as an
    /// error result.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> ToolResult {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.try_dispatch(name, &arguments))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = name, class = e.classification(), error = %e, "Tool call failed");
                if matches!(e, ToolError::Internal(_)) {
                    self.session.record_error(e.to_string()).await;
                }
                ToolResult::error(&e)
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(tool = name, detail = %detail, "Tool handler panicked");
                ToolResult::error(&ToolError::Internal(format!("tool '{}' failed unexpectedly", name)))
            }
        };

        debug!(
            tool = name,
            is_error = result.is_error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        result
    }

    async fn try_dispatch(&self, name: &str, arguments: &Value) -> Result<ToolResult, ToolError> {
        let tool = self.registry.lookup(name)?;
        let call = ToolCall::parse(tool, arguments)?;
        info!(tool = name, "Dispatching tool call");

        if tool.is_local() {
            return match call {
                ToolCall::ConfigureFutuClient(update) => {
                    handlers::configure_futu_client(&self.config, update).await
                }
                _ => handlers::get_client_status(&self.config).await,
            };
        }

        let lease = self.acquire(tool).await?;
        let session = self.session.as_ref();
        match call {
            ToolCall::GetWatchlist { market, group_name } => {
                handlers::get_watchlist(session, &lease, market, &group_name).await
            }
            ToolCall::GetWatchlistGroups { group_type } => {
                handlers::get_watchlist_groups(session, &lease, group_type).await
            }
            ToolCall::GetStockQuote { code } => handlers::get_stock_quote(session, &lease, code).await,
            ToolCall::GetStockHistory { code, period, count } => {
                handlers::get_stock_history(session, &lease, &code, period, count).await
            }
            ToolCall::SearchStock {
                keyword,
                markets,
                limit,
            } => handlers::search_stock(session, &lease, &keyword, &markets, limit).await,
            ToolCall::GetMarketSnapshot { region, codes } => {
                handlers::get_market_snapshot(session, &lease, region, codes).await
            }
            ToolCall::GetAccountInfo { mode } => handlers::get_account_info(session, &lease, mode).await,
            ToolCall::GetPositions { mode } => handlers::get_positions(session, &lease, mode).await,
            ToolCall::ConfigureFutuClient(_) | ToolCall::GetClientStatus => Err(ToolError::Internal(
                format!("tool '{}' was routed to the gateway", name),
            )),
        }
    }

    /// Trading tools unlock first, which also connects.
    async fn acquire(&self, tool: ToolId) -> Result<GatewayLease, ToolError> {
        if tool.requires_unlock() {
            self.session.unlock_if_needed().await
        } else {
            self.session.ensure_connected().await
        }
    }

    /// Close the session. Later calls fail with a connection error.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use futumcp_core::*;
    use futumcp_gateway::{SimulatedGateway, SimulatedGatewayConfig};
    use serde_json::json;
    use std::time::Duration;

    fn setup_with(config: SimulatedGatewayConfig) -> (Arc<SimulatedGateway>, Dispatcher) {
        let gateway = Arc::new(SimulatedGateway::new(config));
        let session = Arc::new(BrokerSessionHandle::new(
            gateway.clone(),
            SessionSettings::default(),
        ));
        (gateway, Dispatcher::new(session))
    }

    fn setup() -> (Arc<SimulatedGateway>, Dispatcher) {
        setup_with(SimulatedGatewayConfig::default())
    }

    fn classification(result: &ToolResult) -> String {
        assert!(result.is_error, "expected an error, got {:?}", result);
        assert_eq!(result.content.len(), 1);
        let text = result.text_content();
        text[1..text.find(']').unwrap()].to_string()
    }

    #[tokio::test]
    async fn test_lists_ten_tools() {
        let (_, dispatcher) = setup();
        let names: Vec<&str> = dispatcher.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"get_watchlist_groups"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (gateway, dispatcher) = setup();
        let result = dispatcher.dispatch("buy_everything", json!({})).await;
        assert_eq!(classification(&result), "UnknownToolError");
        assert!(gateway.connect_history().is_empty());
    }

    #[tokio::test]
    async fn test_quote_bare_code() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch("get_stock_quote", json!({"stock_code": "aapl"}))
            .await;
        assert!(!result.is_error);
        let payload = result.payload().unwrap();
        assert_eq!(payload[0]["code"], json!("US.AAPL"));
        assert_eq!(payload[0]["name"], json!("Apple Inc"));
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_broker_error() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch("get_stock_quote", json!({"stock_code": "ZZZZ"}))
            .await;
        assert_eq!(classification(&result), "BrokerQueryError");
        let status = dispatcher.session().status().await;
        assert!(status.connected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_history_count_and_order() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch(
                "get_stock_history",
                json!({"stock_code": "HK.00700", "period": "60m", "count": 7}),
            )
            .await;
        assert!(!result.is_error);
        let bars = result.payload().unwrap().as_array().unwrap().clone();
        assert_eq!(bars.len(), 7);
        let keys: Vec<&str> = bars.iter().map(|b| b["time_key"].as_str().unwrap()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_history_validation() {
        let (gateway, dispatcher) = setup();
        let result = dispatcher
            .dispatch("get_stock_history", json!({"stock_code": "AAPL", "count": 0}))
            .await;
        assert_eq!(classification(&result), "ValidationError");
        assert!(result.text_content().contains("count"));

        let result = dispatcher.dispatch("get_stock_history", json!({})).await;
        assert_eq!(classification(&result), "ValidationError");
        assert!(result.text_content().contains("stock_code"));
        // Validation happens before any connection attempt
        assert!(gateway.connect_history().is_empty());
    }

    #[tokio::test]
    async fn test_search_tsla_us() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch(
                "search_stock",
                json!({"keyword": "TSLA", "market": "US", "limit": 5}),
            )
            .await;
        assert!(!result.is_error);
        let matches = result.payload().unwrap().as_array().unwrap().clone();
        assert_eq!(matches.len(), 5);
        assert_eq!(matches[0]["code"], json!("US.TSLA"));
        assert!(matches.iter().all(|m| m["market"] == json!("US")));
    }

    #[tokio::test]
    async fn test_search_no_match_is_empty_success() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch("search_stock", json!({"keyword": "NOSUCHNAME"}))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.text_content(), "No stock data");
    }

    #[tokio::test]
    async fn test_watchlist_market_filter() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch("get_watchlist", json!({"market": "HK"}))
            .await;
        assert!(!result.is_error);
        let entries = result.payload().unwrap().as_array().unwrap().clone();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| e["market"] == json!("HK")));
    }

    #[tokio::test]
    async fn test_market_snapshot() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch("get_market_snapshot", json!({"market": "US"}))
            .await;
        assert!(!result.is_error);
        let snapshot = result.payload().unwrap();
        assert_eq!(snapshot["market"], json!("US"));
        assert_eq!(snapshot["quotes"].as_array().unwrap().len(), 3);
        // SPY and QQQ are up, DIA is down
        assert_eq!(snapshot["advancers"], json!(2));
        assert_eq!(snapshot["decliners"], json!(1));
        assert_eq!(snapshot["top_loser"], json!("US.DIA"));
    }

    #[tokio::test]
    async fn test_positions_need_password() {
        let (gateway, dispatcher) = setup();
        let result = dispatcher.dispatch("get_positions", json!({})).await;
        assert_eq!(classification(&result), "TradingLockedError");
        assert_eq!(gateway.unlock_attempts(), 0);

        let result = dispatcher
            .dispatch(
                "configure_futu_client",
                json!({"host": "127.0.0.1", "port": 11111, "unlock_pwd": "123456"}),
            )
            .await;
        assert!(!result.is_error);

        let result = dispatcher.dispatch("get_positions", json!({})).await;
        assert!(!result.is_error, "{:?}", result);
        assert_eq!(result.payload().unwrap().as_array().unwrap().len(), 2);

        let result = dispatcher
            .dispatch("get_account_info", json!({"account_type": "SIMULATE"}))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.payload().unwrap()[0]["account_type"], json!("SIMULATE"));
        assert_eq!(gateway.unlock_attempts(), 1);
    }

    #[tokio::test]
    async fn test_wrong_password_is_trading_locked() {
        let (_, dispatcher) = setup();
        dispatcher
            .dispatch(
                "configure_futu_client",
                json!({"host": "127.0.0.1", "port": 11111, "unlock_pwd": "000000"}),
            )
            .await;
        let result = dispatcher.dispatch("get_account_info", json!({})).await;
        assert_eq!(classification(&result), "TradingLockedError");
    }

    #[tokio::test]
    async fn test_configure_then_status_hides_password() {
        let (_, dispatcher) = setup();
        let result = dispatcher
            .dispatch(
                "configure_futu_client",
                json!({"host": "10.1.2.3", "port": 22222, "unlock_pwd": "pa55-word"}),
            )
            .await;
        assert!(!result.is_error);

        let status = dispatcher.dispatch("get_client_status", json!({})).await;
        assert!(!status.is_error);
        let rendered = serde_json::to_string(&status).unwrap();
        assert!(rendered.contains("10.1.2.3"));
        assert!(rendered.contains("22222"));
        assert!(!rendered.contains("pa55-word"));
    }

    #[tokio::test]
    async fn test_reconfigure_reconnects_to_new_endpoint() {
        let (gateway, dispatcher) = setup();
        dispatcher
            .dispatch("get_stock_quote", json!({"stock_code": "AAPL"}))
            .await;
        dispatcher
            .dispatch("configure_futu_client", json!({"host": "10.0.0.9", "port": 11112}))
            .await;
        dispatcher
            .dispatch("get_stock_quote", json!({"stock_code": "AAPL"}))
            .await;

        assert_eq!(
            gateway.connect_history(),
            vec![
                Endpoint::new("127.0.0.1", 11111),
                Endpoint::new("10.0.0.9", 11112)
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_gateway_then_recovery() {
        let (gateway, dispatcher) = setup();
        gateway.set_reachable(false);
        let result = dispatcher.dispatch("get_watchlist", json!({})).await;
        assert_eq!(classification(&result), "ConnectionError");
        assert!(result.text_content().contains("OpenD"));

        gateway.set_reachable(true);
        let result = dispatcher.dispatch("get_watchlist", json!({})).await;
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_transport_failure_forces_reconnect() {
        let (gateway, dispatcher) = setup();
        dispatcher.dispatch("get_watchlist_groups", json!({})).await;
        gateway.fail_next_query(GatewayError::Disconnected("socket closed".into()));

        let result = dispatcher.dispatch("get_watchlist_groups", json!({})).await;
        assert_eq!(classification(&result), "ConnectionError");
        assert!(!dispatcher.session().status().await.connected);

        let result = dispatcher.dispatch("get_watchlist_groups", json!({})).await;
        assert!(!result.is_error);
        assert_eq!(gateway.connect_history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gateway_times_out() {
        let (_, dispatcher) = setup_with(SimulatedGatewayConfig {
            latency: Duration::from_secs(60),
            ..Default::default()
        });
        let result = dispatcher.dispatch("get_client_status", json!({})).await;
        assert!(!result.is_error);
        let result = dispatcher.dispatch("get_stock_quote", json!({"stock_code": "AAPL"})).await;
        assert_eq!(classification(&result), "ConnectionError");
    }

    #[tokio::test]
    async fn test_after_shutdown() {
        let (_, dispatcher) = setup();
        dispatcher.shutdown().await;
        let result = dispatcher.dispatch("get_stock_quote", json!({"stock_code": "AAPL"})).await;
        assert_eq!(classification(&result), "ConnectionError");
    }

    #[tokio::test]
    async fn test_concurrent_queries_and_reconfigure() {
        let (gateway, dispatcher) = setup_with(SimulatedGatewayConfig {
            latency: Duration::from_millis(2),
            ..Default::default()
        });
        let dispatcher = Arc::new(dispatcher);
        let endpoints = [("10.0.0.1", 11111u16), ("10.0.0.2", 22222u16)];

        let mut tasks = Vec::new();
        for i in 0..40 {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    let (host, port) = endpoints[(i / 4) % 2];
                    dispatcher
                        .dispatch("configure_futu_client", json!({"host": host, "port": port}))
                        .await
                } else {
                    dispatcher
                        .dispatch("get_stock_quote", json!({"stock_code": "US.MSFT"}))
                        .await
                }
            }));
        }

        for task in tasks {
            let result = task.await.unwrap();
            // Every call returns a well-formed envelope
            assert!(!result.content.is_empty());
            if result.is_error {
                assert_eq!(result.content.len(), 1);
            }
        }

        // Each connect used a host and port from the same configuration
        let allowed: Vec<Endpoint> = std::iter::once(Endpoint::new("127.0.0.1", 11111))
            .chain(endpoints.iter().map(|(h, p)| Endpoint::new(*h, *p)))
            .collect();
        for endpoint in gateway.connect_history() {
            assert!(allowed.contains(&endpoint), "mixed endpoint {}", endpoint);
        }

        let status = dispatcher.session().status().await;
        assert!(endpoints
            .iter()
            .any(|(h, p)| *h == status.host && *p == status.port));
    }
}
