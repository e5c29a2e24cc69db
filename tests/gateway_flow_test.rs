//! # 网关端到端流程测试
//!
//! 覆盖队列优先级、节流间隔、无端点快速失败与协调器全生命周期。

mod common;

use common::{ScriptedTransport, coordinator_config, open_throttle, queue_harness};
use sis_gateway::gateway::GatewayCoordinator;
use sis_gateway::queue::QueueOptions;
use sis_gateway::throttle::ThrottleConfig;
use sis_gateway::types::{GatewayRequest, HttpMethod, RequestPriority};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn request(provider: &str) -> GatewayRequest {
    GatewayRequest::new(provider.into(), HttpMethod::Get, "/attendance/daily")
}

#[tokio::test(start_paused = true)]
async fn no_endpoint_provider_fails_fast_instead_of_hanging() {
    let h = queue_harness(
        ScriptedTransport::ok(),
        open_throttle(),
        QueueOptions::default(),
        &[],
    )
    .await;

    let started = Instant::now();
    let response = h
        .queue
        .enqueue_and_wait(
            request("ghost-sis"),
            RequestPriority::Normal,
            Duration::from_secs(5),
            0,
        )
        .await
        .unwrap();

    // 一个派发周期内拿到终态失败，而不是挂满 5 秒
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!response.success);
    assert_eq!(response.status, 404);
    assert!(response.error.unwrap().contains("UPSTREAM_NOT_FOUND"));
    assert!(h.transport.dispatch_log().is_empty());
    h.queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn all_endpoints_unhealthy_fails_without_transport_call() {
    let h = queue_harness(
        ScriptedTransport::ok(),
        open_throttle(),
        QueueOptions::default(),
        &["powerschool"],
    )
    .await;
    h.router.set_endpoint_health("powerschool-1", false);

    let response = h
        .queue
        .enqueue_and_wait(
            request("powerschool"),
            RequestPriority::Normal,
            Duration::from_secs(5),
            0,
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.status, 503);
    assert!(h.transport.dispatch_log().is_empty());
    h.queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn mixed_priorities_dispatch_urgent_normal_low() {
    let h = queue_harness(
        ScriptedTransport::ok(),
        open_throttle(),
        QueueOptions {
            worker_count: 1,
            ..QueueOptions::default()
        },
        &["powerschool"],
    )
    .await;

    // 提交顺序 LOW、URGENT、NORMAL；同步入队，工作协程还未取件
    let low = h
        .queue
        .enqueue(
            request("powerschool"),
            RequestPriority::Low,
            Duration::from_secs(10),
            0,
        )
        .unwrap();
    let urgent = h
        .queue
        .enqueue(
            request("powerschool"),
            RequestPriority::Urgent,
            Duration::from_secs(10),
            0,
        )
        .unwrap();
    let normal = h
        .queue
        .enqueue(
            request("powerschool"),
            RequestPriority::Normal,
            Duration::from_secs(10),
            0,
        )
        .unwrap();

    while h.transport.dispatch_log().len() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let order: Vec<String> = h
        .transport
        .dispatch_log()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(order, vec![urgent, normal, low]);
    h.queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn throttled_provider_spaces_dispatches_without_rejecting() {
    let throttle = ThrottleConfig {
        max_requests_per_second: 1.0,
        max_burst_size: 100,
        burst_window_seconds: 300,
        min_request_interval_ms: 0,
        adaptive_enabled: false,
        ..ThrottleConfig::default()
    };
    let h = queue_harness(
        ScriptedTransport::ok(),
        throttle,
        QueueOptions::default(),
        &["powerschool"],
    )
    .await;

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let queue = h.queue.clone();
        waiters.push(tokio::spawn(async move {
            queue
                .enqueue_and_wait(
                    request("powerschool"),
                    RequestPriority::Normal,
                    Duration::from_secs(30),
                    0,
                )
                .await
                .unwrap()
        }));
    }

    for waiter in waiters {
        let response = waiter.await.unwrap();
        // 全部最终送达，无一被直接拒绝
        assert!(response.success, "error: {:?}", response.error);
    }

    let mut times: Vec<Instant> = h
        .transport
        .dispatch_log()
        .into_iter()
        .map(|(_, at)| at)
        .collect();
    times.sort();
    assert_eq!(times.len(), 5);
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(900),
            "dispatches not spaced by sustained rate"
        );
    }
    h.queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queue_survives_stop_start_cycle() {
    let h = queue_harness(
        ScriptedTransport::ok(),
        open_throttle(),
        QueueOptions::default(),
        &["powerschool"],
    )
    .await;

    h.queue.stop().await;
    h.queue.start().await;

    let response = h
        .queue
        .enqueue_and_wait(
            request("powerschool"),
            RequestPriority::Normal,
            Duration::from_secs(5),
            0,
        )
        .await
        .unwrap();
    assert!(response.success);
    h.queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn coordinator_full_cycle_with_admin_surface() {
    let transport = ScriptedTransport::ok();
    let coordinator =
        GatewayCoordinator::with_transport(coordinator_config("powerschool"), transport.clone());
    coordinator.start().await.unwrap();

    // 正常处理
    let response = coordinator
        .process_request(
            "powerschool".into(),
            HttpMethod::Post,
            "/attendance/sync",
            vec![("date".to_string(), "2026-08-06".to_string())],
            HashMap::new(),
            Some(serde_json::json!({"records": []})),
            RequestPriority::High,
            Some(Duration::from_secs(5)),
        )
        .await;
    assert!(response.success);

    // 管理面：强制熔断后降级并短路
    coordinator
        .admin_command(
            "force_circuit_breaker_open",
            &serde_json::json!({"provider": "powerschool", "reason": "drill"}),
        )
        .await;
    coordinator.evaluate_state();

    let blocked = coordinator
        .process_request(
            "powerschool".into(),
            HttpMethod::Get,
            "/attendance/daily",
            Vec::new(),
            HashMap::new(),
            None,
            RequestPriority::Normal,
            Some(Duration::from_secs(5)),
        )
        .await;
    assert!(!blocked.success);
    assert!(blocked.circuit_breaker_tripped);
    // 熔断短路不产生传输调用
    assert_eq!(transport.dispatch_log().len(), 1);

    let detailed = coordinator
        .admin_command("detailed_status", &serde_json::json!({}))
        .await;
    assert_eq!(detailed["state"], "degraded");
    assert!(detailed["circuit_breakers"]["powerschool"]["forced_open"].as_bool().unwrap());

    coordinator
        .admin_command(
            "force_circuit_breaker_closed",
            &serde_json::json!({"provider": "powerschool"}),
        )
        .await;
    coordinator.evaluate_state();
    assert_eq!(
        coordinator.get_health_status()["state"].as_str().unwrap(),
        "healthy"
    );

    coordinator.stop().await;
    let rejected = coordinator
        .process_request(
            "powerschool".into(),
            HttpMethod::Get,
            "/x",
            Vec::new(),
            HashMap::new(),
            None,
            RequestPriority::Normal,
            None,
        )
        .await;
    assert_eq!(rejected.status, 503);
}

#[tokio::test(start_paused = true)]
async fn transient_transport_failure_is_retried_to_success() {
    let h = queue_harness(
        ScriptedTransport::failing(2),
        open_throttle(),
        QueueOptions::default(),
        &["powerschool"],
    )
    .await;

    let response = h
        .queue
        .enqueue_and_wait(
            request("powerschool"),
            RequestPriority::Normal,
            Duration::from_secs(60),
            3,
        )
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.retry_count, 2);
    assert_eq!(h.transport.dispatch_log().len(), 3);
    h.queue.stop().await;
}
