//! Mutual TLS and bearer-token enforcement.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};

use secure_rpc::error::ProtocolError;
use secure_rpc::greet::{
    GreetRequest, GreetResponse, Greeter, GREET, GREET_EVERYONE, GREET_MANY_TIMES, LONG_GREET,
};
use secure_rpc::protocol::auth::TokenFn;
use secure_rpc::protocol::dispatcher::{RequestStream, Service};
use secure_rpc::service::{CallOptions, Channel};
use secure_rpc::transport::{PemSource, TlsClientConfig};
use secure_rpc::{Code, Status};

use common::{channel_builder, connect, greet_service, start_server, TestPki};

fn request() -> GreetRequest {
    GreetRequest::new(Greeter::new("John", "Doe"))
}

fn hello(req: GreetRequest) -> GreetResponse {
    GreetResponse {
        result: format!("Hello {}!", req.greeter.first_name),
    }
}

/// Greet service in every call shape, counting handler invocations
fn counting_service(invocations: Arc<AtomicUsize>) -> Service {
    let (streamed, collected, chatted) = (invocations.clone(), invocations.clone(), invocations.clone());
    Service::builder("greet.GreetService")
        .unary(GREET, move |_ctx, req: GreetRequest| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(hello(req))
            }
        })
        .unwrap()
        .server_streaming(GREET_MANY_TIMES, move |_ctx, req: GreetRequest| {
            streamed.fetch_add(1, Ordering::SeqCst);
            async move { Ok(stream::iter([Ok(hello(req))])) }
        })
        .unwrap()
        .client_streaming(LONG_GREET, move |_ctx, requests: RequestStream<GreetRequest>| {
            collected.fetch_add(1, Ordering::SeqCst);
            async move {
                let count = requests.count().await;
                Ok(GreetResponse {
                    result: format!("{count} greetings"),
                })
            }
        })
        .unwrap()
        .bidi_streaming(GREET_EVERYONE, move |_ctx, requests: RequestStream<GreetRequest>| {
            chatted.fetch_add(1, Ordering::SeqCst);
            async move { Ok(requests.map(|r| r.map(hello))) }
        })
        .unwrap()
        .build()
}

/// Outcome of a server-streaming, a client-streaming and a bidi call on `channel`.
///
/// Request senders keep sending past the rejection and must report the
/// rejection status rather than a local error.
async fn streaming_call_statuses(channel: &Channel) -> Vec<Status> {
    let server_streaming = match channel
        .server_streaming::<_, GreetResponse>(&GREET_MANY_TIMES, &request(), CallOptions::new())
        .await
    {
        Ok(mut responses) => responses.message().await.unwrap_err(),
        Err(status) => status,
    };

    let mut upload = channel
        .client_streaming::<GreetRequest, GreetResponse>(&LONG_GREET, CallOptions::new())
        .await
        .unwrap();
    let first = upload.send(&request()).await;
    let second = upload.send(&request()).await;
    let client_streaming = first.and(second).unwrap_err();
    let reply = upload.close_and_recv().await.unwrap_err();
    assert_eq!(reply.code(), client_streaming.code());

    let (mut sender, mut responses) = channel
        .bidi_streaming::<GreetRequest, GreetResponse>(&GREET_EVERYONE, CallOptions::new())
        .await
        .unwrap();
    let first = sender.send(&request()).await;
    let second = sender.send(&request()).await;
    let bidi = first.and(second).unwrap_err();
    let reply = responses.message().await.unwrap_err();
    assert_eq!(reply.code(), bidi.code());

    vec![server_streaming, client_streaming, bidi]
}

#[tokio::test]
async fn wrong_token_is_rejected_before_the_handler() {
    let pki = TestPki::generate();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = start_server(&pki, counting_service(invocations.clone())).await;

    let channel = channel_builder(&pki, "bad-token")
        .open(&server.address())
        .await
        .unwrap();
    let status = channel
        .unary::<_, GreetResponse>(&GREET, &request(), CallOptions::new())
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(server.metrics.snapshot().calls_rejected, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let pki = TestPki::generate();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = start_server(&pki, counting_service(invocations.clone())).await;

    let channel = Channel::open(&server.address(), pki.client_tls()).await.unwrap();
    let status = channel
        .unary::<_, GreetResponse>(&GREET, &request(), CallOptions::new())
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_token_is_rejected_for_streaming_calls() {
    let pki = TestPki::generate();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = start_server(&pki, counting_service(invocations.clone())).await;

    let channel = channel_builder(&pki, "bad-token")
        .open(&server.address())
        .await
        .unwrap();
    for status in streaming_call_statuses(&channel).await {
        assert_eq!(status.code(), Code::Unauthenticated, "{}", status.message());
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(server.metrics.snapshot().calls_rejected, 3);

    server.shutdown().await;
}

#[tokio::test]
async fn missing_token_is_rejected_for_streaming_calls() {
    let pki = TestPki::generate();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = start_server(&pki, counting_service(invocations.clone())).await;

    let channel = Channel::open(&server.address(), pki.client_tls()).await.unwrap();
    for status in streaming_call_statuses(&channel).await {
        assert_eq!(status.code(), Code::Unauthenticated, "{}", status.message());
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn valid_token_reaches_the_handler_once() {
    let pki = TestPki::generate();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = start_server(&pki, counting_service(invocations.clone())).await;
    let channel = connect(&pki, &server).await;

    let reply: GreetResponse = channel
        .unary(&GREET, &request(), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.result, "Hello John!");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn missing_client_certificate_fails_open() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;

    let result = Channel::open(&server.address(), pki.anonymous_client_tls()).await;
    let err = result.expect_err("server requires a client certificate");
    assert!(err.is_connection_error(), "unexpected error: {err}");

    let mut failed = 0;
    for _ in 0..50 {
        failed = server.metrics.snapshot().handshakes_failed;
        if failed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(failed, 1);
    assert_eq!(server.metrics.snapshot().calls_started, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn certificate_from_foreign_ca_fails_open() {
    let pki = TestPki::generate();
    let stranger = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;

    let tls = pki.anonymous_client_tls().with_client_certificate(
        PemSource::pem(stranger.client.cert.clone()),
        PemSource::pem(stranger.client.key.clone()),
    );
    assert!(Channel::open(&server.address(), tls).await.is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn untrusted_server_fails_open() {
    let pki = TestPki::generate();
    let other = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;

    // trusts a different CA than the one that signed the server
    let tls = TlsClientConfig::new(PemSource::pem(other.ca.clone()))
        .with_authority("localhost")
        .with_client_certificate(
            PemSource::pem(pki.client.cert.clone()),
            PemSource::pem(pki.client.key.clone()),
        );
    let err = Channel::open(&server.address(), tls).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TlsError(_)), "unexpected error: {err}");

    server.shutdown().await;
}

#[tokio::test]
async fn authority_must_match_server_certificate() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;

    let tls = pki.client_tls().with_authority("greet.example.com");
    let err = Channel::open(&server.address(), tls).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TlsError(_)), "unexpected error: {err}");

    server.shutdown().await;
}

#[tokio::test]
async fn failing_credentials_send_nothing() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;

    let channel = Channel::builder(pki.client_tls())
        .credentials(TokenFn::new(|| async {
            Err::<String, _>(ProtocolError::Auth("token refresh failed".into()))
        }))
        .open(&server.address())
        .await
        .unwrap();

    let status = channel
        .unary::<_, GreetResponse>(&GREET, &request(), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
    assert!(matches!(status.cause(), Some(ProtocolError::Auth(_))));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.metrics.snapshot().calls_started, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn refreshed_token_is_accepted() {
    let pki = TestPki::generate();
    let server = start_server(&pki, greet_service()).await;

    let channel = Channel::builder(pki.client_tls())
        .credentials(TokenFn::new(|| async { Ok(common::TOKEN.to_string()) }))
        .open(&server.address())
        .await
        .unwrap();

    let reply: GreetResponse = channel
        .unary(&GREET, &request(), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.result, "Hello John!");

    server.shutdown().await;
}
