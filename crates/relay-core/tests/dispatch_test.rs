// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request submission through a running core: validation, publishing and
//! the blocking path.

mod common;

use std::time::Duration;

use common::*;
use relay_core::broker::Broker;
use relay_core::catalog::Catalog;
use relay_core::error::RpcErrorKind;
use relay_core::rpc::{ClientError, ProcessRequestParams, RpcClient, RpcRequest};
use relay_model::{
    Choices, ChoicesDetails, ChoicesType, ParameterType, Request, RequestStatus, RequestUpdate,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const QUEUE: &str = "echo.1-0-0.default";

fn submit(request: Request, blocking: bool, timeout_ms: Option<u64>) -> RpcRequest {
    RpcRequest::ProcessRequest(ProcessRequestParams::New {
        request: Box::new(request),
        blocking,
        timeout_ms,
    })
}

fn remote_error(result: Result<serde_json::Value, ClientError>) -> relay_core::error::RpcError {
    match result {
        Err(ClientError::Remote(e)) => e,
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_happy_path_publishes_to_instance_queue() {
    let ctx = TestContext::new().await;
    ctx.register(echo_system(vec![command(
        "say",
        vec![parameter("message", ParameterType::String)],
    )]))
    .await;

    let created: Request = serde_json::from_value(
        ctx.call(submit(
            Request::new("echo", "1.0.0", "default", "say").with_parameter("message", json!("hi")),
            false,
            None,
        ))
        .await
        .unwrap(),
    )
    .unwrap();
    assert_eq!(created.status, RequestStatus::Created);
    let id = created.id.clone().unwrap();

    let stored = ctx.catalog.get_request(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Created);
    assert_eq!(stored.parameters["message"], json!("hi"));

    let queued = ctx.broker.peek(QUEUE);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].message.headers["request_id"], id);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_parameter_bounds() {
    let ctx = TestContext::new().await;
    let mut count = parameter("count", ParameterType::Integer);
    count.minimum = Some(1.0);
    count.maximum = Some(3.0);
    ctx.register(echo_system(vec![command("repeat", vec![count])]))
        .await;

    let request = |n: i64| {
        submit(
            Request::new("echo", "1.0.0", "default", "repeat").with_parameter("count", json!(n)),
            false,
            None,
        )
    };

    let low = remote_error(ctx.call(request(0)).await);
    assert_eq!(low.code, "MODEL_VALIDATION_ERROR");
    assert_eq!(low.kind, RpcErrorKind::InvalidRequest);
    assert!(low.message.contains("minimum"), "{}", low.message);

    let high = remote_error(ctx.call(request(4)).await);
    assert_eq!(high.code, "MODEL_VALIDATION_ERROR");
    assert!(high.message.contains("maximum"), "{}", high.message);

    ctx.call(request(2)).await.unwrap();
    assert_eq!(ctx.broker.peek(QUEUE).len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_static_choices_map_follows_sibling() {
    let ctx = TestContext::new().await;
    let mut child = parameter("child", ParameterType::String);
    child.choices = Some(Choices {
        choices_type: ChoicesType::Static,
        value: json!({"a": ["x", "y"], "b": ["z"]}),
        strict: true,
        details: ChoicesDetails {
            key_reference: Some("parent".into()),
            ..Default::default()
        },
        ..Default::default()
    });
    ctx.register(echo_system(vec![command(
        "pick",
        vec![parameter("parent", ParameterType::String), child],
    )]))
    .await;

    let request = |child: &str| {
        submit(
            Request::new("echo", "1.0.0", "default", "pick")
                .with_parameter("parent", json!("a"))
                .with_parameter("child", json!(child)),
            false,
            None,
        )
    };

    ctx.call(request("y")).await.unwrap();
    let err = remote_error(ctx.call(request("z")).await);
    assert_eq!(err.code, "MODEL_VALIDATION_ERROR");
    assert!(err.message.contains("child"), "{}", err.message);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_url_choices_fetched_with_references() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions"))
        .and(query_param("kind", "cloud"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"value": "eu", "text": "Europe"}, "us"])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/regions"))
        .and(query_param("kind", "broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ctx = TestContext::new().await;
    let mut region = parameter("region", ParameterType::String);
    region.choices = Some(Choices {
        choices_type: ChoicesType::Url,
        value: json!(format!("{}/regions?kind=${{kind}}", server.uri())),
        strict: true,
        ..Default::default()
    });
    ctx.register(echo_system(vec![command(
        "deploy",
        vec![parameter("kind", ParameterType::String), region],
    )]))
    .await;

    let request = |kind: &str, region: &str| {
        submit(
            Request::new("echo", "1.0.0", "default", "deploy")
                .with_parameter("kind", json!(kind))
                .with_parameter("region", json!(region)),
            false,
            None,
        )
    };

    ctx.call(request("cloud", "eu")).await.unwrap();
    ctx.call(request("cloud", "us")).await.unwrap();

    let err = remote_error(ctx.call(request("cloud", "ap")).await);
    assert!(err.message.contains("region"), "{}", err.message);

    let err = remote_error(ctx.call(request("broken", "eu")).await);
    assert!(err.message.contains("failed"), "{}", err.message);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_blocking_request_completes_on_update() {
    let ctx = TestContext::new().await;
    ctx.register(echo_system(vec![command("say", vec![])])).await;

    // The plugin side: take the request off its queue and report success
    // over a second connection.
    let broker = ctx.broker.clone();
    let addr = ctx.runtime.rpc_addr();
    let plugin = tokio::spawn(async move {
        let client = RpcClient::connect(addr, Duration::from_secs(5)).await.unwrap();
        loop {
            if let Some(message) = broker.get_message(QUEUE).await.unwrap() {
                let request: Request = serde_json::from_slice(&message.body).unwrap();
                client
                    .call(&RpcRequest::UpdateRequest {
                        request_id: request.id.unwrap(),
                        update: RequestUpdate::success("hello"),
                    })
                    .await
                    .unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let done: Request = serde_json::from_value(
        ctx.call(submit(
            Request::new("echo", "1.0.0", "default", "say"),
            true,
            None,
        ))
        .await
        .unwrap(),
    )
    .unwrap();
    plugin.await.unwrap();

    assert_eq!(done.status, RequestStatus::Success);
    assert_eq!(done.output.as_deref(), Some("hello"));
    let stored = ctx
        .catalog
        .get_request(done.id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, done);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_blocking_request_times_out() {
    let ctx = TestContext::new().await;
    ctx.register(echo_system(vec![command("say", vec![])])).await;

    let err = remote_error(
        ctx.call(submit(
            Request::new("echo", "1.0.0", "default", "say"),
            true,
            Some(50),
        ))
        .await,
    );
    assert_eq!(err.code, "WAIT_TIMEOUT");
    assert_eq!(err.status, 408);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unknown_instance_and_cancel() {
    let ctx = TestContext::new().await;
    ctx.register(echo_system(vec![command("say", vec![])])).await;

    let err = remote_error(
        ctx.call(submit(
            Request::new("echo", "1.0.0", "other", "say"),
            false,
            None,
        ))
        .await,
    );
    assert_eq!(err.code, "UNKNOWN_INSTANCE");
    assert_eq!(err.status, 404);

    let created: Request = serde_json::from_value(
        ctx.call(submit(
            Request::new("echo", "1.0.0", "default", "say"),
            false,
            None,
        ))
        .await
        .unwrap(),
    )
    .unwrap();
    let request_id = created.id.unwrap();

    let canceled: Request = serde_json::from_value(
        ctx.call(RpcRequest::CancelRequest {
            request_id: request_id.clone(),
        })
        .await
        .unwrap(),
    )
    .unwrap();
    assert_eq!(canceled.status, RequestStatus::Canceled);

    let err = remote_error(
        ctx.call(RpcRequest::UpdateRequest {
            request_id: request_id.clone(),
            update: RequestUpdate::success("late"),
        })
        .await,
    );
    assert_eq!(err.code, "REQUEST_ALREADY_COMPLETED");
    assert_eq!(err.kind, RpcErrorKind::ConflictException);

    let err = remote_error(
        ctx.call(RpcRequest::ProcessRequest(ProcessRequestParams::Existing {
            request_id,
        }))
        .await,
    );
    assert_eq!(err.code, "REQUEST_ALREADY_COMPLETED");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_clearing_queue_wakes_blocking_caller() {
    let ctx = TestContext::new().await;
    ctx.register(echo_system(vec![command("say", vec![])])).await;

    let addr = ctx.runtime.rpc_addr();
    let caller = tokio::spawn(async move {
        let client = RpcClient::connect(addr, Duration::from_secs(5)).await.unwrap();
        client
            .call(&submit(
                Request::new("echo", "1.0.0", "default", "say"),
                true,
                Some(5_000),
            ))
            .await
    });

    let broker = ctx.broker.clone();
    assert!(
        wait_for(|| {
            let broker = broker.clone();
            async move { !broker.peek(QUEUE).is_empty() }
        })
        .await
    );
    let wait_map = ctx.runtime.state().dispatcher.wait_map().clone();
    assert_eq!(wait_map.len(), 1);

    let removed = ctx
        .call(RpcRequest::ClearQueue {
            queue_name: QUEUE.into(),
        })
        .await
        .unwrap();
    assert_eq!(removed, json!(1));

    let started = tokio::time::Instant::now();
    let done: Request = serde_json::from_value(caller.await.unwrap().unwrap()).unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(done.status, RequestStatus::Canceled);
    assert!(wait_map.is_empty());

    ctx.shutdown().await;
}
