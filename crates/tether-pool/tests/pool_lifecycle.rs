//! Connection manager behaviour against in-process providers: routing,
//! reconnection, health checks and registry maintenance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tether_mcp::{InProcessFactory, InProcessProvider, JsonRpcError, PROTOCOL_VERSION, Reply, ServerConfig};
use tether_pool::{
    ConnectionManager, ConnectionStatus, LoadBalanceStrategy, ManagerEvent, PoolConfig, PoolError,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

fn server(name: &str) -> ServerConfig {
    ServerConfig {
        timeout_ms: 1000,
        retry_delay_ms: 20,
        ..ServerConfig::stdio(name, "unused", vec![])
    }
}

fn quiet_pool(servers: Vec<ServerConfig>) -> PoolConfig {
    PoolConfig {
        health_check_interval_ms: 0,
        ..PoolConfig::with_servers(servers)
    }
}

/// A provider offering `tools`, each answering with the provider's name.
fn provider(name: &str, tools: &[&str]) -> InProcessProvider {
    let tools = tools.iter().map(|t| json!({"name": t})).collect();
    let me = name.to_string();
    InProcessProvider::with_tools(name, tools, move |tool, args| {
        Reply::Result(json!({"from": me, "tool": tool, "args": args}))
    })
}

fn manager_for(providers: &[&InProcessProvider], config: PoolConfig) -> ConnectionManager {
    let mut factory = InProcessFactory::new();
    for p in providers {
        factory.register((*p).clone());
    }
    ConnectionManager::with_transport_factory(config, Arc::new(factory))
}

async fn wait_for(
    events: &mut broadcast::Receiver<ManagerEvent>,
    matches: impl Fn(&ManagerEvent) -> bool,
) -> ManagerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event within 5s")
}

async fn wait_for_status(manager: &ConnectionManager, name: &str, status: ConnectionStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.connection_status(name).await != Some(status) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("'{name}' never became {status}"));
}

#[tokio::test]
async fn initialize_connects_all_servers_concurrently() {
    let a = provider("a", &["alpha"]);
    let b = provider("b", &["beta"]);
    let c = provider("c", &["alpha", "gamma"]);
    let manager = manager_for(
        &[&a, &b, &c],
        quiet_pool(vec![server("a"), server("b"), server("c")]),
    );

    let report = manager.initialize().await;
    assert_eq!(report.connected, vec!["a", "b", "c"]);
    assert!(report.all_connected());

    let status = manager.status().await;
    assert_eq!(status.total, 3);
    assert_eq!(status.ready, 3);
    assert_eq!(status.tool_count, 3);
    assert_eq!(manager.tool_providers("alpha").await, vec!["a", "c"]);
    for p in [&a, &b, &c] {
        assert_eq!(
            p.received_methods()[..2],
            ["initialize", "notifications/initialized"]
        );
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn round_robin_spreads_calls_across_providers() {
    let a = provider("a", &["echo"]);
    let b = provider("b", &["echo"]);
    let manager = manager_for(&[&a, &b], quiet_pool(vec![server("a"), server("b")]));
    manager.initialize().await;

    let mut used = Vec::new();
    for i in 0..4 {
        let outcome = manager.call_tool("echo", json!({"n": i})).await.unwrap();
        assert_eq!(outcome.result["from"], Value::String(outcome.connection.clone()));
        assert_eq!(outcome.result["args"]["n"], i);
        used.push(outcome.connection);
    }
    assert_eq!(used, vec!["a", "b", "a", "b"]);
    assert_eq!(a.calls("tools/call"), 2);
    assert_eq!(b.calls("tools/call"), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn calls_only_reach_advertising_providers() {
    let a = provider("a", &["alpha"]);
    let b = provider("b", &["beta"]);
    let manager = manager_for(&[&a, &b], quiet_pool(vec![server("a"), server("b")]));
    manager.initialize().await;

    for _ in 0..3 {
        assert_eq!(
            manager.get_available_connection(Some("beta")).await.as_deref(),
            Some("b")
        );
    }
    assert_eq!(manager.get_available_connection(Some("toolX")).await, None);
    assert!(manager.get_available_connection(None).await.is_some());

    match manager.call_tool("toolX", json!({})).await {
        Err(PoolError::NoProvider { tool }) => assert_eq!(tool, "toolX"),
        other => panic!("Expected NoProvider, got {other:?}"),
    }
    assert_eq!(a.calls("tools/call") + b.calls("tools/call"), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn random_strategy_picks_a_ready_provider() {
    let a = provider("a", &["echo"]);
    let b = provider("b", &["echo"]);
    let config = PoolConfig {
        load_balance_strategy: LoadBalanceStrategy::Random,
        ..quiet_pool(vec![server("a"), server("b")])
    };
    let manager = manager_for(&[&a, &b], config);
    manager.initialize().await;

    for _ in 0..10 {
        let picked = manager.get_available_connection(Some("echo")).await.unwrap();
        assert!(picked == "a" || picked == "b");
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn least_connections_avoids_busy_provider() {
    let slow = |name: &str| {
        InProcessProvider::with_tools(name, vec![json!({"name": "slow"})], |_, _| {
            Reply::delayed(Duration::from_millis(200), Reply::Result(json!({"done": true})))
        })
    };
    let a = slow("a");
    let b = slow("b");
    let config = PoolConfig {
        load_balance_strategy: LoadBalanceStrategy::LeastConnections,
        ..quiet_pool(vec![server("a"), server("b")])
    };
    let manager = manager_for(&[&a, &b], config);
    manager.initialize().await;

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.call_tool("slow", json!({})).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = manager.status().await;
            if status.connections[0].in_flight == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("call in flight");

    assert_eq!(
        manager.get_available_connection(Some("slow")).await.as_deref(),
        Some("b")
    );
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.connection, "a");
    assert_eq!(manager.status().await.connections[0].in_flight, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn crashed_provider_is_reconnected_with_backoff() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![]));
    manager.add_connection(server("a")).await.unwrap();
    let mut events = manager.subscribe();

    assert!(a.crash());

    let mut path = Vec::new();
    loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                ManagerEvent::StatusChanged { .. } | ManagerEvent::ReconnectScheduled { .. }
            )
        })
        .await
        {
            ManagerEvent::ReconnectScheduled {
                name,
                attempt,
                delay_ms,
            } => {
                assert_eq!(name, "a");
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 20);
            }
            ManagerEvent::StatusChanged { to, .. } => {
                path.push(to);
                if to == ConnectionStatus::Ready {
                    break;
                }
            }
            _ => unreachable!(),
        }
    }

    use ConnectionStatus::*;
    assert_eq!(
        path,
        vec![Disconnected, Reconnecting, Connecting, Connected, Initializing, Ready]
    );
    assert_eq!(a.connection_count(), 2);
    let snapshot = &manager.status().await.connections[0];
    assert_eq!(snapshot.retry_count, 0);
    assert!(snapshot.connected_at.is_some());

    // Registry repopulated after the reconnect
    wait_for(&mut events, |e| {
        matches!(e, ManagerEvent::RegistryChanged { tool_count: 1 })
    })
    .await;
    assert_eq!(manager.tool_providers("alpha").await, vec!["a"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn reconnect_gives_up_after_max_retries() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![]));
    manager
        .add_connection(ServerConfig {
            max_retries: 2,
            retry_delay_ms: 10,
            ..server("a")
        })
        .await
        .unwrap();
    let mut events = manager.subscribe();

    a.set_refuse_connections(true);
    assert!(a.crash());

    let mut delays = Vec::new();
    let attempts = loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                ManagerEvent::ReconnectScheduled { .. } | ManagerEvent::ReconnectExhausted { .. }
            )
        })
        .await
        {
            ManagerEvent::ReconnectScheduled { attempt, delay_ms, .. } => {
                delays.push((attempt, delay_ms));
            }
            ManagerEvent::ReconnectExhausted { attempts, .. } => break attempts,
            _ => unreachable!(),
        }
    };

    assert_eq!(delays, vec![(1, 10), (2, 20)]);
    assert_eq!(attempts, 2);
    assert_eq!(
        manager.connection_status("a").await,
        Some(ConnectionStatus::Error)
    );
    assert_eq!(a.connection_count(), 1);
    assert!(manager.status().await.connections[0].error_count >= 2);

    // No further attempt once exhausted
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        manager.connection_status("a").await,
        Some(ConnectionStatus::Error)
    );

    // Manual intervention brings it back
    a.set_refuse_connections(false);
    manager.connect_server("a").await.unwrap();
    assert_eq!(
        manager.connection_status("a").await,
        Some(ConnectionStatus::Ready)
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn disabled_auto_reconnect_stays_disconnected() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![]));
    manager
        .add_connection(ServerConfig {
            auto_reconnect: false,
            ..server("a")
        })
        .await
        .unwrap();

    assert!(a.crash());
    wait_for_status(&manager, "a", ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        manager.connection_status("a").await,
        Some(ConnectionStatus::Disconnected)
    );
    assert_eq!(a.connection_count(), 1);
    assert_eq!(manager.get_available_connection(Some("alpha")).await, None);
    manager.shutdown().await;
}

/// Answers the handshake itself and stops answering pings while `silent`.
fn flaky_provider(silent: Arc<AtomicBool>) -> InProcessProvider {
    InProcessProvider::new("flaky", move |method, _| match method {
        "initialize" => Reply::Result(json!({"protocolVersion": PROTOCOL_VERSION, "capabilities": {}})),
        "tools/list" => Reply::Result(json!({"tools": [{"name": "probe"}]})),
        "ping" if silent.load(Ordering::SeqCst) => Reply::Silent,
        "ping" => Reply::Result(json!({})),
        other => Reply::Error(JsonRpcError::method_not_found(other)),
    })
}

#[tokio::test]
async fn failed_health_check_marks_error_and_reconnects() {
    let silent = Arc::new(AtomicBool::new(false));
    let flaky = flaky_provider(Arc::clone(&silent));
    let manager = manager_for(&[&flaky], quiet_pool(vec![]));
    manager
        .add_connection(ServerConfig {
            timeout_ms: 100,
            retry_delay_ms: 50,
            ..server("flaky")
        })
        .await
        .unwrap();

    let report = manager.check_health().await;
    assert_eq!(report.healthy, vec!["flaky"]);
    assert!(report.failed.is_empty());

    let mut events = manager.subscribe();
    silent.store(true, Ordering::SeqCst);
    let report = manager.check_health().await;
    assert_eq!(report.failed, vec!["flaky"]);
    assert!(manager.tool_providers("probe").await.is_empty());
    silent.store(false, Ordering::SeqCst);

    wait_for(&mut events, |e| {
        matches!(
            e,
            ManagerEvent::StatusChanged {
                to: ConnectionStatus::Error,
                ..
            }
        )
    })
    .await;
    wait_for_status(&manager, "flaky", ConnectionStatus::Ready).await;
    assert_eq!(flaky.connection_count(), 2);
    assert!(manager.status().await.connections[0].error_count >= 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn periodic_health_check_detects_silent_provider() {
    let silent = Arc::new(AtomicBool::new(true));
    let flaky = flaky_provider(Arc::clone(&silent));
    let config = PoolConfig {
        health_check_interval_ms: 50,
        ..PoolConfig::with_servers(vec![ServerConfig {
            timeout_ms: 100,
            auto_reconnect: false,
            ..server("flaky")
        }])
    };
    let manager = manager_for(&[&flaky], config);
    let mut events = manager.subscribe();

    // Handshake does not ping, so startup succeeds
    assert!(manager.initialize().await.all_connected());
    wait_for(&mut events, |e| {
        matches!(
            e,
            ManagerEvent::StatusChanged {
                from: ConnectionStatus::Ready,
                to: ConnectionStatus::Error,
                ..
            }
        )
    })
    .await;
    manager.shutdown().await;
}

#[tokio::test]
async fn tools_changed_notification_refreshes_registry() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![server("a")]));
    manager.initialize().await;
    assert_eq!(manager.tools().await.len(), 1);
    let mut events = manager.subscribe();

    a.set_tools(vec![json!({"name": "alpha"}), json!({"name": "omega"})]);
    assert!(a.notify("notifications/tools/list_changed", None));

    wait_for(&mut events, |e| {
        matches!(e, ManagerEvent::RegistryChanged { tool_count: 2 })
    })
    .await;
    assert_eq!(manager.tool_providers("omega").await, vec!["a"]);

    assert!(a.notify("notifications/resources/list_changed", None));
    let event = wait_for(&mut events, |e| {
        matches!(e, ManagerEvent::ResourcesChanged { .. })
    })
    .await;
    assert_eq!(event, ManagerEvent::ResourcesChanged { name: "a".into() });
    manager.shutdown().await;
}

#[tokio::test]
async fn remove_connection_drops_its_tools() {
    let a = provider("a", &["alpha"]);
    let b = provider("b", &["beta"]);
    let manager = manager_for(&[&a, &b], quiet_pool(vec![server("a"), server("b")]));
    manager.initialize().await;
    let mut events = manager.subscribe();

    manager.remove_connection("a").await.unwrap();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ManagerEvent::ConnectionRemoved { .. })).await,
        ManagerEvent::ConnectionRemoved { name: "a".into() }
    );
    assert!(manager.tool_providers("alpha").await.is_empty());
    assert_eq!(manager.tool_providers("beta").await, vec!["b"]);
    assert_eq!(manager.status().await.total, 1);
    assert!(manager.client("a").await.is_none());

    assert!(matches!(
        manager.remove_connection("a").await,
        Err(PoolError::UnknownConnection { .. })
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn manual_reconnect_of_ready_connection() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![server("a")]));
    manager.initialize().await;

    manager.connect_server("a").await.unwrap();
    assert_eq!(a.connection_count(), 2);
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The replaced client's close is not treated as a lost connection
    assert_eq!(
        manager.connection_status("a").await,
        Some(ConnectionStatus::Ready)
    );
    assert_eq!(a.connection_count(), 2);
    assert!(manager.call_tool("alpha", json!({})).await.is_ok());
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_scheduled_reconnect() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![]));
    manager
        .add_connection(ServerConfig {
            retry_delay_ms: 200,
            ..server("a")
        })
        .await
        .unwrap();
    let mut events = manager.subscribe();

    assert!(a.crash());
    wait_for(&mut events, |e| {
        matches!(e, ManagerEvent::ReconnectScheduled { .. })
    })
    .await;
    manager.shutdown().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(a.connection_count(), 1);
    assert_eq!(manager.status().await.total, 0);
}

#[tokio::test]
async fn status_snapshot_serializes() {
    let a = provider("a", &["alpha"]);
    let manager = manager_for(&[&a], quiet_pool(vec![server("a")]));
    manager.initialize().await;
    manager.call_tool("alpha", json!({})).await.unwrap();

    let status = serde_json::to_value(manager.status().await).unwrap();
    assert_eq!(status["strategy"], "round-robin");
    assert_eq!(status["ready"], 1);
    let connection = &status["connections"][0];
    assert_eq!(connection["name"], "a");
    assert_eq!(connection["status"], "ready");
    assert_eq!(connection["transport"], "stdio");
    assert_eq!(connection["request_count"], 1);
    assert!(connection["last_activity"].is_string());
    manager.shutdown().await;
}
