mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc;

use common::*;
use ripc::*;

#[tokio::test]
async fn test_twoway_reply_and_connection_reuse() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let mut request = proxy.request("sayHello");
    request.payload = Bytes::from_static(b"world");
    let reply = proxy.invoke(request).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.payload, Bytes::from_static(b"world"));

    proxy.invoke(proxy.request("sayHello")).await.unwrap();
    assert_eq!(establisher.connects(), 1);
    assert!(matches!(
        proxy.handler_cache().cached(),
        Some(RequestHandler::Bound(_))
    ));
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 2);
}

#[tokio::test]
async fn test_queued_calls_flush_in_order() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    establisher.hold();
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let calls: Vec<_> = ["first", "second", "third"]
        .iter()
        .map(|op| proxy.begin_invoke(proxy.request(op), None))
        .collect();
    assert!(calls.iter().all(|c| !c.is_sent()));
    assert!(proxy.cached_connection().is_none());

    establisher.open();
    for result in join_all(calls).await {
        result.unwrap();
    }
    let log = establisher.connection(&endpoint).unwrap().log();
    assert_eq!(
        log,
        vec![
            vec!["first".to_owned()],
            vec!["second".to_owned()],
            vec!["third".to_owned()]
        ]
    );
    assert_eq!(establisher.connects(), 1);
}

#[tokio::test]
async fn test_sent_request_is_not_retried_unless_idempotent() {
    let establisher = MockEstablisher::new(Behavior::FailAfterSend(ErrorKind::ConnectionLost));
    let instance = instance(&establisher, config(vec![0, 0]));
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let err = proxy.invoke(proxy.request("transfer")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 1);

    let mut request = proxy.request("balance");
    request.mode = OperationMode::Idempotent;
    let err = proxy.invoke(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    // first attempt plus one retry per interval
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 4);
}

#[tokio::test]
async fn test_unsent_request_is_retried() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, config(vec![0]));
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());
    proxy.invoke(proxy.request("warmup")).await.unwrap();

    let connection = establisher.connection(&endpoint).unwrap();
    connection.script(vec![Behavior::FailBeforeSend(ErrorKind::ConnectionLost)]);
    proxy.invoke(proxy.request("transfer")).await.unwrap();
    assert_eq!(connection.sends(), 2);
}

#[tokio::test]
async fn test_graceful_close_retried_once_past_the_budget() {
    let establisher = MockEstablisher::new(Behavior::FailAfterSend(ErrorKind::CloseConnection));
    let instance = instance(&establisher, config(vec![-1]));
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let err = proxy.invoke(proxy.request("transfer")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CloseConnection);
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 2);
}

#[tokio::test]
async fn test_dead_connection_is_replaced_without_counting_a_retry() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, config(vec![-1]));
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());
    proxy.invoke(proxy.request("warmup")).await.unwrap();
    proxy.invoke(proxy.request("warmup")).await.unwrap();

    let first = establisher.connection(&endpoint).unwrap();
    first.kill();
    proxy.invoke(proxy.request("sayHello")).await.unwrap();

    let second = establisher.connection(&endpoint).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.sends(), 1);
    assert_eq!(establisher.connects(), 2);
}

#[tokio::test]
async fn test_connect_failures_follow_retry_intervals() {
    tokio::time::pause();
    let establisher = MockEstablisher::new(Behavior::Echo);
    let endpoint = Endpoint::tcp("hello", 10000);
    establisher.refuse(&endpoint);
    let instance = instance(&establisher, config(vec![0, 100, 500]));
    let proxy = direct_proxy(&instance, endpoint);

    let start = tokio::time::Instant::now();
    let err = proxy.invoke(proxy.request("sayHello")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert_eq!(establisher.connects(), 4);
    assert!(start.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn test_invocation_timeout() {
    tokio::time::pause();
    let establisher = MockEstablisher::new(Behavior::Hold);
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone()).with_invocation_timeout(50);

    let call = proxy.begin_invoke(proxy.request("sleep"), None);
    let invocation = call.invocation().unwrap().clone();
    let err = call.await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvocationTimeout);
    assert_eq!(invocation.phase(), Phase::TimedOut);
    assert!(invocation.is_sent());

    let connection = establisher.connection(&endpoint).unwrap();
    assert_eq!(connection.sends(), 1);
    assert_eq!(connection.pending(), 0);
}

#[tokio::test]
async fn test_cancel_sent_call() {
    let establisher = MockEstablisher::new(Behavior::Hold);
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let call = proxy.begin_invoke(proxy.request("sleep"), None);
    until(|| {
        establisher
            .connection(&endpoint)
            .map_or(false, |c| c.pending() == 1)
    })
    .await;
    call.cancel();
    let invocation = call.invocation().unwrap().clone();
    assert_eq!(call.await.unwrap_err().kind(), ErrorKind::InvocationCanceled);
    assert_eq!(invocation.phase(), Phase::Canceled);
}

#[tokio::test]
async fn test_canceled_queued_call_never_reaches_connection() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    establisher.hold();
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let call = proxy.begin_invoke(proxy.request("sayHello"), None);
    call.cancel();
    establisher.open();
    assert_eq!(call.await.unwrap_err().kind(), ErrorKind::InvocationCanceled);

    let connection = proxy.connection().await.unwrap();
    assert!(connection.is_some());
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 0);
}

#[tokio::test]
async fn test_oneway_completes_once_written() {
    let establisher = MockEstablisher::new(Behavior::Hold);
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone()).with_oneway();

    let reply = proxy.invoke(proxy.request("notify")).await.unwrap();
    assert_eq!(reply.payload, Bytes::new());
    let connection = establisher.connection(&endpoint).unwrap();
    assert_eq!(connection.sends(), 1);
    assert_eq!(connection.pending(), 0);

    assert_eq!(
        proxy.check_twoway_only("getName").unwrap_err().kind(),
        ErrorKind::TwowayOnly
    );
    let err = proxy
        .invoke_twoway(proxy.request("getName"))
        .await
        .unwrap_err();
    assert_eq!(err.operation(), Some("getName"));
}

#[tokio::test]
async fn test_sent_callback() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, ClientConfig::default());
    let proxy = direct_proxy(&instance, Endpoint::tcp("hello", 10000));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sent: SentCallback = Arc::new(move |synchronously| {
        let _ = tx.send(synchronously);
    });

    // the first call waits for the connection and is written later
    let call = proxy.begin_invoke(proxy.request("first"), Some(sent.clone()));
    assert!(!call.sent_synchronously());
    call.await.unwrap();
    assert_eq!(rx.recv().await, Some(false));

    // the connection is known now: the request is written right away
    let call = proxy.begin_invoke(proxy.request("second"), Some(sent));
    assert!(call.sent_synchronously());
    assert_eq!(rx.recv().await, Some(true));
    call.await.unwrap();
}

#[tokio::test]
async fn test_object_not_exist_on_direct_reference_is_terminal() {
    let establisher = MockEstablisher::new(Behavior::Status(ReplyStatus::ObjectNotExist));
    let instance = instance(&establisher, config(vec![0, 0]));
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());

    let err = proxy.invoke(proxy.request("sayHello")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotExist);
    assert_eq!(err.operation(), Some("sayHello"));
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 1);
}

#[tokio::test]
async fn test_batch_requests_sent_on_flush() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, ClientConfig::default());
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone()).with_batch_oneway();

    for op in &["a", "b", "c"] {
        proxy.invoke(proxy.request(op)).await.unwrap();
    }
    assert_eq!(establisher.connects(), 0);
    assert_eq!(proxy.reference().batch_queue().unwrap().len(), 3);

    proxy.flush_batch_requests().await.unwrap();
    let log = establisher.connection(&endpoint).unwrap().log();
    assert_eq!(log, vec![vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]]);
    assert!(proxy.reference().batch_queue().unwrap().is_empty());

    // nothing queued: nothing sent
    proxy.flush_batch_requests().await.unwrap();
    assert_eq!(establisher.connection(&endpoint).unwrap().sends(), 1);
}

#[tokio::test]
async fn test_fixed_proxy() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, config(vec![0]));
    let endpoint = Endpoint::tcp("hello", 10000);
    let proxy = direct_proxy(&instance, endpoint.clone());
    let connection = proxy.connection().await.unwrap().unwrap();

    let fixed = proxy.with_facet("admin").with_fixed(connection);
    assert!(fixed.reference().is_fixed());
    assert_eq!(fixed.reference().facet(), "admin");
    fixed.invoke(fixed.request("shutdown")).await.unwrap();

    establisher.connection(&endpoint).unwrap().kill();
    let err = fixed.invoke(fixed.request("shutdown")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert_eq!(establisher.connects(), 1);
}

#[tokio::test]
async fn test_destroyed_instance_rejects_invocations() {
    let establisher = MockEstablisher::new(Behavior::Echo);
    let instance = instance(&establisher, ClientConfig::default());
    let proxy = direct_proxy(&instance, Endpoint::tcp("hello", 10000));

    instance.destroy();
    let err = proxy.invoke(proxy.request("sayHello")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommunicatorDestroyed);
    assert_eq!(establisher.connects(), 0);
}
