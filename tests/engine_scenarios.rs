//! End-to-end scenarios over the real bus: scripted exchange transports
//! on the outside, every engine wired exactly as in production.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use gridbot::app::App;
use gridbot::bus::{topics, Event, MemoryJournal};
use gridbot::config::AccountsConfig;
use gridbot::data::frames::OrderUpdateFrame;
use gridbot::data::user_ws::UserWsEvent;
use gridbot::domain::Kline;
use gridbot::testkit::{
    count_subject, server_error, wait_for_subject, MarketStreamHandle, ScriptedApi,
    ScriptedMarketStream, ScriptedTransport, ScriptedUserStream, UserStreamHandle,
};
use gridbot::trade::FeeRates;

fn candles(count: usize) -> Vec<Kline> {
    (0..count)
        .map(|i| {
            let close = dec!(1) + Decimal::from(i as i64) * dec!(0.0005);
            Kline {
                open_time: i as i64 * 900_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(10),
                close_time: (i as i64 + 1) * 900_000 - 1,
                is_closed: true,
            }
        })
        .collect()
}

fn write_strategy(dir: &Path, pairs: serde_json::Value, extra: serde_json::Value) {
    let mut base = json!({
        "timeframe": "15m",
        "leverage": 10,
        "position_side": "BOTH",
        "margin_mode": "cross",
        "margin_type": "USDC",
        "trading_pairs": pairs
    });
    if let (Some(base_map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
    let path = dir.join("strategies").join("u1");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("ma_stop_st.json"), base.to_string()).unwrap();
}

struct Harness {
    app: App,
    api: Arc<ScriptedApi>,
    #[allow(dead_code)]
    market: MarketStreamHandle,
    user: UserStreamHandle,
    _dir: tempfile::TempDir,
}

fn harness(pairs: serde_json::Value, extra: serde_json::Value) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    write_strategy(dir.path(), pairs, extra);

    let api = ScriptedApi::shared()
        .with_balance(dec!(1000))
        .with_klines(candles(200));
    let transport = ScriptedTransport::new(Arc::clone(&api));
    let (market_stream, market) = ScriptedMarketStream::channelled();
    transport.push_market_stream(market_stream);
    let (user_stream, user) = ScriptedUserStream::channelled();
    transport.push_user_stream(user_stream);

    let app = App::compose(
        Arc::new(MemoryJournal::new()),
        Arc::new(transport),
        dir.path().to_path_buf(),
        FeeRates::default(),
        None,
        None,
    );

    let accounts: AccountsConfig = serde_json::from_value(json!({
        "users": {
            "u1": { "name": "alice", "api_key": "k", "api_secret": "s", "strategy": "ma_stop_st" }
        }
    }))
    .unwrap();
    app.start(&accounts);

    Harness { app, api, market, user, _dir: dir }
}

fn single_pair() -> serde_json::Value {
    json!([{ "symbol": "XRPUSDC", "indicator_params": { "ma_stop_ta": { "period": 20 } } }])
}

async fn wait_for_count(harness: &Harness, subject: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if count_subject(&harness.app.bus, subject) >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} x {subject}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn payloads(harness: &Harness, subject: &str) -> Vec<serde_json::Value> {
    let mut entries: Vec<serde_json::Value> = harness
        .app
        .bus
        .query_recent(1000)
        .into_iter()
        .filter(|e| e.subject == subject)
        .map(|e| serde_json::from_str(&e.data).unwrap())
        .collect();
    // query_recent is newest first; tests read oldest first.
    entries.reverse();
    entries
}

/// Fill a submitted order through the user-data stream, the way the
/// exchange reports it.
async fn fill_order(harness: &Harness, client_order_id: &str, price: &str, quantity: &str) {
    let submitted = payloads(harness, topics::ORDER_SUBMITTED);
    let ack = submitted
        .iter()
        .find(|p| p["client_order_id"] == client_order_id)
        .unwrap_or_else(|| panic!("no submission ack for {client_order_id}"));
    harness.user.send(UserWsEvent::Order(OrderUpdateFrame {
        symbol: ack["symbol"].as_str().unwrap().to_string(),
        order_id: ack["order_id"].as_i64().unwrap(),
        client_order_id: client_order_id.to_string(),
        side: "BUY".to_string(),
        status: "FILLED".to_string(),
        last_fill_quantity: quantity.parse().unwrap(),
        last_fill_price: price.parse().unwrap(),
        filled_quantity: quantity.parse().unwrap(),
        fee: Decimal::ZERO,
    }));
}

fn publish_calculation(harness: &Harness, signal: &str) {
    harness.app.bus.publish(Event::new(
        topics::CALCULATION_COMPLETED,
        json!({
            "user_id": "u1", "symbol": "XRPUSDC", "interval": "15m",
            "close_price": "1.00",
            "results": { "ma_stop_ta": { "signal": signal, "data": {} } }
        }),
    ));
}

#[tokio::test]
async fn account_load_reaches_strategy_ready_without_failures() {
    let harness = harness(single_pair(), json!({}));

    wait_for_subject(&harness.app.bus, topics::INDICATOR_CREATED).await;
    wait_for_subject(&harness.app.bus, topics::HISTORICAL_KLINES_SUCCESS).await;

    let subjects: Vec<String> = harness
        .app
        .bus
        .query_recent(1000)
        .into_iter()
        .map(|e| e.subject)
        .collect();
    for expected in [
        topics::ACCOUNT_LOADED,
        topics::CLIENT_CONNECTED,
        topics::STRATEGY_LOADED,
        topics::INDICATOR_SUBSCRIBE,
        topics::GET_HISTORICAL_KLINES,
        topics::INDICATOR_CREATED,
    ] {
        assert!(subjects.contains(&expected.to_string()), "missing {expected}");
    }
    assert!(
        subjects.iter().all(|s| !s.contains("fail")),
        "unexpected failure topics: {subjects:?}"
    );
}

#[tokio::test]
async fn two_indicators_aggregate_into_one_completed_calculation() {
    let harness = harness(
        json!([{
            "symbol": "XRPUSDC",
            "indicator_params": { "ma": { "period": 20 }, "rsi": { "period": 14 } }
        }]),
        json!({}),
    );

    wait_for_count(&harness, topics::INDICATOR_CREATED, 2).await;
    wait_for_count(&harness, topics::HISTORICAL_KLINES_SUCCESS, 2).await;
    // Let the initialization handlers finish marking instances ready.
    tokio::time::sleep(Duration::from_millis(300)).await;

    harness.market.closed_kline("XRPUSDC", "15m");
    wait_for_subject(&harness.app.bus, topics::CALCULATION_COMPLETED).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(count_subject(&harness.app.bus, topics::CALCULATION_COMPLETED), 1);
    let completed = payloads(&harness, topics::CALCULATION_COMPLETED);
    let results = completed[0]["results"].as_object().unwrap();
    assert!(results.contains_key("ma"));
    assert!(results.contains_key("rsi"));
}

#[tokio::test]
async fn no_grid_trade_round_trip() {
    let harness = harness(single_pair(), json!({}));
    wait_for_subject(&harness.app.bus, topics::INDICATOR_CREATED).await;
    // Sizing needs the balance round trip to have landed.
    wait_for_subject(&harness.app.bus, topics::ACCOUNT_BALANCE).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Composite LONG from flat: market buy.
    publish_calculation(&harness, "LONG");
    wait_for_subject(&harness.app.bus, topics::ORDER_SUBMITTED).await;
    let create = &payloads(&harness, topics::ORDER_CREATE)[0];
    assert_eq!(create["side"], "BUY");
    assert_eq!(create["order_type"], "MARKET");
    let entry_id = create["client_order_id"].as_str().unwrap().to_string();
    let quantity = create["quantity"].as_str().unwrap().to_string();

    fill_order(&harness, &entry_id, "1.00", &quantity).await;
    wait_for_subject(&harness.app.bus, topics::POSITION_OPENED).await;
    let opened = &payloads(&harness, topics::POSITION_OPENED)[0];
    assert_eq!(opened["side"], "BUY");
    assert_eq!(opened["mode"], "NO_GRID");
    // Give the strategy's own position handler time to observe it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Composite SHORT while long: market sell close, then closed event.
    publish_calculation(&harness, "SHORT");
    wait_for_count(&harness, topics::ORDER_SUBMITTED, 2).await;
    let close = payloads(&harness, topics::ORDER_CREATE)
        .into_iter()
        .find(|p| p["side"] == "SELL")
        .expect("close order created");
    assert_eq!(close["reduce_only"], true);
    let close_id = close["client_order_id"].as_str().unwrap().to_string();

    fill_order(&harness, &close_id, "1.10", &quantity).await;
    wait_for_subject(&harness.app.bus, topics::POSITION_CLOSED).await;
    let closed = &payloads(&harness, topics::POSITION_CLOSED)[0];
    assert_eq!(closed["side"], "BUY");
    assert_eq!(closed["exit_price"], "1.10");
}

#[tokio::test]
async fn reverse_strategy_reenters_opposite_after_close() {
    let harness = harness(single_pair(), json!({ "reverse": true }));
    wait_for_subject(&harness.app.bus, topics::INDICATOR_CREATED).await;
    wait_for_subject(&harness.app.bus, topics::ACCOUNT_BALANCE).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_calculation(&harness, "LONG");
    wait_for_subject(&harness.app.bus, topics::ORDER_SUBMITTED).await;
    let create = &payloads(&harness, topics::ORDER_CREATE)[0];
    let entry_id = create["client_order_id"].as_str().unwrap().to_string();
    let quantity = create["quantity"].as_str().unwrap().to_string();
    fill_order(&harness, &entry_id, "1.00", &quantity).await;
    wait_for_subject(&harness.app.bus, topics::POSITION_OPENED).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_calculation(&harness, "SHORT");
    wait_for_count(&harness, topics::ORDER_SUBMITTED, 2).await;
    let close = payloads(&harness, topics::ORDER_CREATE)
        .into_iter()
        .find(|p| p["side"] == "SELL" && p["reduce_only"] == true)
        .expect("close order");
    let close_id = close["client_order_id"].as_str().unwrap().to_string();
    fill_order(&harness, &close_id, "1.10", &quantity).await;
    wait_for_subject(&harness.app.bus, topics::POSITION_CLOSED).await;

    // The close immediately reverses into a short entry.
    wait_for_count(&harness, topics::SIGNAL_GENERATED, 3).await;
    let reverse = payloads(&harness, topics::SIGNAL_GENERATED)
        .into_iter()
        .last()
        .unwrap();
    assert_eq!(reverse["action"], "OPEN");
    assert_eq!(reverse["side"], "SELL");
    wait_for_count(&harness, topics::ORDER_SUBMITTED, 3).await;
}

#[tokio::test]
async fn normal_grid_deploys_and_realises_pair_profit() {
    let harness = harness(
        single_pair(),
        json!({
            "grid_trading": {
                "enabled": true, "grid_type": "normal", "grid_levels": 10,
                "upper_price": "1.05", "lower_price": "0.95"
            }
        }),
    );
    wait_for_subject(&harness.app.bus, topics::INDICATOR_CREATED).await;
    wait_for_subject(&harness.app.bus, topics::ACCOUNT_BALANCE).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_calculation(&harness, "LONG");
    // Ten pairs, both legs submitted.
    wait_for_count(&harness, topics::ORDER_SUBMITTED, 20).await;
    let creates = payloads(&harness, topics::ORDER_CREATE);
    assert_eq!(creates.len(), 20);

    let rung = |side: &str, price: &str| {
        creates
            .iter()
            .find(|p| p["side"] == side && p["price"] == price)
            .unwrap_or_else(|| panic!("no {side} rung at {price}"))
            .clone()
    };
    let buy = rung("BUY", "0.95");
    let qty = buy["quantity"].as_str().unwrap().to_string();
    fill_order(&harness, buy["client_order_id"].as_str().unwrap(), "0.95", &qty).await;
    wait_for_subject(&harness.app.bus, topics::POSITION_OPENED).await;
    let opened = &payloads(&harness, topics::POSITION_OPENED)[0];
    assert_eq!(opened["mode"], "NORMAL_GRID");
    assert_eq!(opened["entry_price"], "0.95");

    let sell = rung("SELL", "0.96");
    fill_order(&harness, sell["client_order_id"].as_str().unwrap(), "0.96", &qty).await;
    // The completed pair re-arms both legs.
    wait_for_count(&harness, topics::ORDER_CREATE, 22).await;
}

#[tokio::test]
async fn order_submission_retries_transient_errors() {
    let harness = harness(single_pair(), json!({}));
    wait_for_subject(&harness.app.bus, topics::CLIENT_CONNECTED).await;
    let attempts_before = harness.api.submit_attempts();

    harness.api.push_submit_result(Err(server_error()));
    harness.api.push_submit_result(Err(server_error()));
    harness.app.bus.publish(Event::new(
        topics::ORDER_CREATE,
        json!({
            "user_id": "u1", "symbol": "XRPUSDC", "side": "BUY", "order_type": "MARKET",
            "price": null, "quantity": "100", "client_order_id": "manual-1", "reduce_only": false
        }),
    ));

    wait_for_subject(&harness.app.bus, topics::ORDER_SUBMITTED).await;
    assert_eq!(count_subject(&harness.app.bus, topics::ORDER_SUBMITTED), 1);
    assert_eq!(harness.api.submit_attempts() - attempts_before, 3);
    assert_eq!(count_subject(&harness.app.bus, topics::ORDER_FAILED), 0);
}

#[tokio::test]
async fn order_submission_exhausts_retries_with_single_failure() {
    let harness = harness(single_pair(), json!({}));
    wait_for_subject(&harness.app.bus, topics::CLIENT_CONNECTED).await;

    for _ in 0..3 {
        harness.api.push_submit_result(Err(server_error()));
    }
    harness.app.bus.publish(Event::new(
        topics::ORDER_CREATE,
        json!({
            "user_id": "u1", "symbol": "XRPUSDC", "side": "BUY", "order_type": "MARKET",
            "price": null, "quantity": "100", "client_order_id": "manual-2", "reduce_only": false
        }),
    ));

    wait_for_subject(&harness.app.bus, topics::ORDER_FAILED).await;
    assert_eq!(count_subject(&harness.app.bus, topics::ORDER_FAILED), 1);
    let failed = &payloads(&harness, topics::ORDER_FAILED)[0];
    assert_eq!(failed["retry_count"], 3);
    assert_eq!(count_subject(&harness.app.bus, topics::ORDER_SUBMITTED), 0);
}

#[tokio::test]
async fn market_reconnect_restores_every_subscription() {
    let dir = tempfile::tempdir().unwrap();
    write_strategy(
        dir.path(),
        json!([
            { "symbol": "XRPUSDC", "indicator_params": { "ma": { "period": 20 } } },
            { "symbol": "BTCUSDC", "indicator_params": { "ma": { "period": 20 } } }
        ]),
        json!({}),
    );

    let api = ScriptedApi::shared()
        .with_balance(dec!(1000))
        .with_klines(candles(200));
    let transport = ScriptedTransport::new(Arc::clone(&api));
    let (market_stream, market) = ScriptedMarketStream::channelled();
    let (connect_count, subscription_log) = market_stream.probes();
    transport.push_market_stream(market_stream);
    transport.push_user_stream(ScriptedUserStream::new());

    let app = App::compose(
        Arc::new(MemoryJournal::new()),
        Arc::new(transport),
        dir.path().to_path_buf(),
        FeeRates::default(),
        None,
        None,
    );
    let accounts: AccountsConfig = serde_json::from_value(json!({
        "users": {
            "u1": { "name": "alice", "api_key": "k", "api_secret": "s", "strategy": "ma_stop_st" }
        }
    }))
    .unwrap();
    app.start(&accounts);
    let harness = Harness { app, api, market: market.clone(), user: {
        let (_, handle) = ScriptedUserStream::channelled();
        handle
    }, _dir: dir };

    // Both pairs subscribed on the live socket.
    wait_for_count(&harness, topics::HISTORICAL_KLINES_SUCCESS, 2).await;
    let connects_before = connect_count.load(std::sync::atomic::Ordering::SeqCst);

    market.disconnect("forced close");
    wait_for_subject(&harness.app.bus, topics::WS_DISCONNECTED).await;

    // After reconnecting, the full set is re-issued in one call.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let restored = subscription_log
            .lock()
            .unwrap()
            .iter()
            .any(|subs| subs.len() == 2);
        if restored {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "subscriptions not restored");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(connect_count.load(std::sync::atomic::Ordering::SeqCst) > connects_before);

    // Fresh candle events flow for both pairs after the reconnect.
    market.closed_kline("XRPUSDC", "15m");
    market.closed_kline("BTCUSDC", "15m");
    wait_for_count(&harness, topics::KLINE_UPDATE, 2).await;
    let updates = payloads(&harness, topics::KLINE_UPDATE);
    let symbols: Vec<&str> = updates.iter().filter_map(|p| p["symbol"].as_str()).collect();
    assert!(symbols.contains(&"XRPUSDC"));
    assert!(symbols.contains(&"BTCUSDC"));
}
