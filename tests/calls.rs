//! End-to-end calls in all four conventions over loopback mutual TLS.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};

use secure_rpc::greet::{
    GreetRequest, GreetResponse, Greeter, GREET, GREET_EVERYONE, GREET_MANY_TIMES, LONG_GREET,
};
use secure_rpc::protocol::auth::AuthenticatedIdentity;
use secure_rpc::error::constants;
use secure_rpc::protocol::dispatcher::{RequestStream, Service};
use secure_rpc::protocol::registry::{CallKind, MethodDescriptor};
use secure_rpc::service::CallOptions;
use secure_rpc::{Code, Status};

use common::{connect, greet_service, start_server, TestPki, TOKEN};

fn request(first_name: &str) -> GreetRequest {
    GreetRequest::new(Greeter::new(first_name, "Doe"))
}

fn response(result: impl Into<String>) -> GreetResponse {
    GreetResponse {
        result: result.into(),
    }
}

#[tokio::test]
async fn unary_greet_says_hello() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let reply: GreetResponse = channel
        .unary(&GREET, &request("John"), CallOptions::new())
        .await
        .expect("greet");
    assert_eq!(reply.result, "Hello John!");

    channel.close(Duration::from_secs(1)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn handler_sees_token_and_identity() {
    let pki = TestPki::generate();
    let service = Service::builder("greet.GreetService")
        .unary(GREET, |ctx, _req: GreetRequest| async move {
            let token = ctx.metadata().get("token").unwrap_or_default().to_string();
            let subject = ctx
                .get::<AuthenticatedIdentity>()
                .map(|id| id.subject.clone())
                .unwrap_or_default();
            Ok(response(format!("{token}|{subject}|{}", ctx.metadata().get("x-trace").unwrap_or("-"))))
        })
        .unwrap()
        .build();
    let server = start_server(&pki, service).await;
    let channel = connect(&pki, &server).await;

    let options = CallOptions::new().with_metadata("X-Trace", "abc");
    let reply: GreetResponse = channel.unary(&GREET, &request("John"), options).await.unwrap();
    assert_eq!(reply.result, format!("{TOKEN}|{TOKEN}|abc"));

    server.shutdown().await;
}

#[tokio::test]
async fn server_streaming_delivers_ten_in_order() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let mut responses = channel
        .server_streaming::<_, GreetResponse>(&GREET_MANY_TIMES, &request("John"), CallOptions::new())
        .await
        .unwrap();

    let mut results = Vec::new();
    while let Some(reply) = responses.message().await.unwrap() {
        results.push(reply.result);
    }

    let expected: Vec<String> = (0..10).map(|i| format!("Hello John number {i}")).collect();
    assert_eq!(results, expected);
    assert_eq!(responses.status().map(|s| s.code()), Some(Code::Ok));
    // rereading after the end gives the same outcome
    assert!(responses.message().await.unwrap().is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn client_streaming_concatenates_greetings() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let mut call = channel
        .client_streaming::<GreetRequest, GreetResponse>(&LONG_GREET, CallOptions::new())
        .await
        .unwrap();
    for name in ["John", "Jane", "Mark"] {
        call.send(&request(name)).await.unwrap();
    }
    let reply = call.close_and_recv().await.unwrap();
    assert_eq!(reply.result, "Hello John! Hello Jane! Hello Mark! ");

    server.shutdown().await;
}

#[tokio::test]
async fn client_streaming_accepts_empty_stream() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let call = channel
        .client_streaming::<GreetRequest, GreetResponse>(&LONG_GREET, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(call.close_and_recv().await.unwrap().result, "");

    server.shutdown().await;
}

#[tokio::test]
async fn bidi_replies_in_request_order() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let (mut sender, mut responses) = channel
        .bidi_streaming::<GreetRequest, GreetResponse>(&GREET_EVERYONE, CallOptions::new())
        .await
        .unwrap();

    let names = ["John", "Jane", "Mark", "Lucy"];
    for name in names {
        sender.send(&request(name)).await.unwrap();
        let reply = responses.message().await.unwrap().expect("reply per request");
        assert_eq!(reply.result, format!("Hello {name}! "));
    }

    sender.close_send().await;
    assert!(responses.message().await.unwrap().is_none());
    assert!(responses.status().unwrap().is_ok());

    let err = sender.send(&request("late")).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    server.shutdown().await;
}

#[tokio::test]
async fn bidi_responses_as_stream() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let (mut sender, responses) = channel
        .bidi_streaming::<GreetRequest, GreetResponse>(&GREET_EVERYONE, CallOptions::new())
        .await
        .unwrap();
    for name in ["a", "b", "c"] {
        sender.send(&request(name)).await.unwrap();
    }
    drop(sender);

    let results: Vec<String> = responses
        .into_stream()
        .map(|r| r.unwrap().result)
        .collect()
        .await;
    assert_eq!(results, vec!["Hello a! ", "Hello b! ", "Hello c! "]);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let missing = MethodDescriptor::named("greet.GreetService/Farewell", CallKind::Unary);
    let status = channel
        .unary::<_, GreetResponse>(&missing, &request("John"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    server.shutdown().await;
}

#[tokio::test]
async fn handler_status_reaches_client() {
    let pki = TestPki::generate();
    let service = Service::builder("greet.GreetService")
        .unary(GREET, |_ctx, req: GreetRequest| async move {
            if req.greeter.first_name.is_empty() {
                return Err(Status::invalid_argument("first name required"));
            }
            Ok(response("fine"))
        })
        .unwrap()
        .build();
    let server = start_server(&pki, service).await;
    let channel = connect(&pki, &server).await;

    let status = channel
        .unary::<_, GreetResponse>(&GREET, &request(""), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "first name required");

    server.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_is_internal_and_server_survives() {
    let pki = TestPki::generate();
    let service = Service::builder("greet.GreetService")
        .unary(GREET, |_ctx, req: GreetRequest| async move {
            if req.greeter.first_name == "boom" {
                panic!("handler exploded");
            }
            Ok(response("still here"))
        })
        .unwrap()
        .build();
    let server = start_server(&pki, service).await;
    let channel = connect(&pki, &server).await;

    let status = channel
        .unary::<_, GreetResponse>(&GREET, &request("boom"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);

    let reply: GreetResponse = channel
        .unary(&GREET, &request("ok"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.result, "still here");

    server.shutdown().await;
}

#[tokio::test]
async fn deadline_expires_slow_call() {
    let pki = TestPki::generate();
    let service = Service::builder("greet.GreetService")
        .unary(GREET, |_ctx, _req: GreetRequest| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(response("too late"))
        })
        .unwrap()
        .build();
    let server = start_server(&pki, service).await;
    let channel = connect(&pki, &server).await;

    let started = std::time::Instant::now();
    let status = channel
        .unary::<_, GreetResponse>(
            &GREET,
            &request("John"),
            CallOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(2));

    server.shutdown().await;
}

#[tokio::test]
async fn cancelling_server_stream_stops_production() {
    let pki = TestPki::generate();
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = produced.clone();
    let service = Service::builder("greet.GreetService")
        .server_streaming(GREET_MANY_TIMES, move |_ctx, _req: GreetRequest| {
            let counter = counter.clone();
            async move {
                Ok(stream::unfold(0u64, move |i| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Some((Ok(response(format!("tick {i}"))), i + 1))
                    }
                }))
            }
        })
        .unwrap()
        .build();
    let server = start_server(&pki, service).await;
    let channel = connect(&pki, &server).await;

    let mut responses = channel
        .server_streaming::<_, GreetResponse>(&GREET_MANY_TIMES, &request("John"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(responses.message().await.unwrap().unwrap().result, "tick 0");
    assert_eq!(responses.message().await.unwrap().unwrap().result, "tick 1");

    responses.cancel();
    assert_eq!(responses.status().map(|s| s.code()), Some(Code::Cancelled));
    assert_eq!(responses.message().await.unwrap_err().code(), Code::Cancelled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(produced.load(Ordering::SeqCst), settled);

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_share_one_channel() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let calls = (0..20).map(|i| {
        let channel = channel.clone();
        async move {
            let reply: GreetResponse = channel
                .unary(&GREET, &request(&format!("caller{i}")), CallOptions::new())
                .await
                .unwrap();
            assert_eq!(reply.result, format!("Hello caller{i}!"));
        }
    });
    futures::future::join_all(calls).await;

    let snapshot = server.metrics.snapshot();
    assert_eq!(snapshot.calls_started, 20);
    assert_eq!(snapshot.connections_total, 1);

    server.shutdown().await;
}

/// Greet plus a bidi method that never reads its requests and a stream of `count` replies
fn stalling_service(count: u32) -> Service {
    Service::builder("greet.GreetService")
        .unary(GREET, |_ctx, req: GreetRequest| async move {
            Ok(response(format!("Hello {}!", req.greeter.first_name)))
        })
        .unwrap()
        .server_streaming(GREET_MANY_TIMES, move |_ctx, _req: GreetRequest| async move {
            Ok(stream::iter((0..count).map(|i| Ok(response(format!("reply {i}"))))))
        })
        .unwrap()
        .bidi_streaming(GREET_EVERYONE, |_ctx, requests: RequestStream<GreetRequest>| async move {
            let replies = requests.map(|r| r.map(|req| response(req.greeter.first_name)));
            Ok(stream::pending().chain(replies))
        })
        .unwrap()
        .build()
}

#[tokio::test]
async fn stalled_request_stream_does_not_block_other_calls() {
    let pki = TestPki::generate();
    let server = start_server(&pki, stalling_service(0)).await;
    let channel = connect(&pki, &server).await;

    let (mut sender, responses) = channel
        .bidi_streaming::<GreetRequest, GreetResponse>(&GREET_EVERYONE, CallOptions::new())
        .await
        .unwrap();
    let sending = tokio::spawn(async move {
        for i in 0..200 {
            if sender.send(&request(&format!("flood{i}"))).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sending.is_finished(), "sender waits for credit");

    let reply: GreetResponse = tokio::time::timeout(
        Duration::from_secs(5),
        channel.unary(&GREET, &request("John"), CallOptions::new()),
    )
    .await
    .expect("unary not blocked by the stalled call")
    .unwrap();
    assert_eq!(reply.result, "Hello John!");
    assert_eq!(server.metrics.snapshot().protocol_errors, 0);

    sending.abort();
    drop(responses);
    server.shutdown().await;
}

#[tokio::test]
async fn unread_response_stream_does_not_block_other_calls() {
    let pki = TestPki::generate();
    let server = start_server(&pki, stalling_service(200)).await;
    let channel = connect(&pki, &server).await;

    let mut responses = channel
        .server_streaming::<_, GreetResponse>(&GREET_MANY_TIMES, &request("John"), CallOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply: GreetResponse = tokio::time::timeout(
        Duration::from_secs(5),
        channel.unary(&GREET, &request("Jane"), CallOptions::new()),
    )
    .await
    .expect("unary not blocked by the unread stream")
    .unwrap();
    assert_eq!(reply.result, "Hello Jane!");

    // the stalled stream resumes once read
    for i in 0..200 {
        let message = responses.message().await.unwrap().expect("reply");
        assert_eq!(message.result, format!("reply {i}"));
    }
    assert!(responses.message().await.unwrap().is_none());
    assert!(responses.status().unwrap().is_ok());
    assert_eq!(channel.metrics().snapshot().protocol_errors, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn long_request_stream_flows_within_credit() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;
    let channel = connect(&pki, &server).await;

    let mut call = channel
        .client_streaming::<GreetRequest, GreetResponse>(&LONG_GREET, CallOptions::new())
        .await
        .unwrap();
    for i in 0..100 {
        call.send(&request(&format!("n{i}"))).await.unwrap();
    }
    let reply = call.close_and_recv().await.unwrap();
    assert_eq!(reply.result.matches("Hello n").count(), 100);
    assert_eq!(server.metrics.snapshot().protocol_errors, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn unary_without_response_is_internal() {
    let pki = TestPki::generate();
    let silent = MethodDescriptor::named("greet.GreetService/Silent", CallKind::ServerStreaming);
    let service = Service::builder("greet.GreetService")
        .server_streaming(silent, |_ctx, _req: GreetRequest| async move {
            Ok(stream::empty::<Result<GreetResponse, Status>>())
        })
        .unwrap()
        .build();
    let server = start_server(&pki, service).await;
    let channel = connect(&pki, &server).await;

    let as_unary = MethodDescriptor::named("greet.GreetService/Silent", CallKind::Unary);
    let status = channel
        .unary::<_, GreetResponse>(&as_unary, &request("John"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains(constants::ERR_MISSING_RESPONSE));
    assert_eq!(channel.metrics().snapshot().protocol_errors, 1);

    server.shutdown().await;
}
