//! Stream-in and stream-out: body fidelity in both directions and close
//! propagation from the client's reader to the backend's.

use arbor_tests::{
    eventually,
    fake::{CloseChecker, FakeContainer},
    TestServer,
};
use std::{sync::atomic::Ordering, time::Duration};
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn stream_in_delivers_the_body_to_the_backend() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());

    let data = b"chunk-1;chunk-2;chunk-3;";
    server
        .client()
        .container("some-handle")
        .stream_in("/dst/path", &data[..])
        .await
        .expect("stream in failed");

    assert_eq!(
        *fake.streamed_in.lock().unwrap(),
        vec![("/dst/path".to_string(), data.to_vec())]
    );
}

#[tokio::test]
async fn stream_in_failures_surface() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    fake.fail("stream_in", "oh no!");

    let err = server
        .client()
        .container("some-handle")
        .stream_in("/dst/path", &b"data"[..])
        .await
        .expect_err("stream in succeeded");
    assert!(err.to_string().contains("oh no!"));
}

#[tokio::test]
async fn stream_in_on_an_unknown_handle_fails() {
    let server = TestServer::start_default().await;

    let err = server
        .client()
        .container("nope")
        .stream_in("/dst/path", &b"data"[..])
        .await
        .expect_err("stream in succeeded");
    assert_eq!(err.to_string(), "unknown handle: nope");
}

#[tokio::test]
async fn stream_out_delivers_the_backends_bytes() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    *fake.stream_out_data.lock().unwrap() = b"hello-world!".to_vec();
    server.backend.install(fake.clone());

    let mut reader = server
        .client()
        .container("some-handle")
        .stream_out("/src/path")
        .await
        .expect("stream out failed");

    let mut content = Vec::new();
    reader
        .read_to_end(&mut content)
        .await
        .expect("read failed");

    assert_eq!(content, b"hello-world!");
    assert_eq!(
        *fake.streamed_out.lock().unwrap(),
        vec!["/src/path".to_string()]
    );
}

#[tokio::test]
async fn closing_the_stream_out_reader_closes_the_backends() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    let (checker, closed) = CloseChecker::new();
    *fake.stream_out_reader.lock().unwrap() = Some(Box::new(checker));
    server.backend.install(fake.clone());

    let reader = server
        .client()
        .container("some-handle")
        .stream_out("/src/path")
        .await
        .expect("stream out failed");

    drop(reader);

    assert!(eventually(Duration::from_secs(5), || closed.load(Ordering::SeqCst)).await);
}

#[tokio::test]
async fn stream_out_failures_surface() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    fake.fail("stream_out", "oh no!");

    let err = server
        .client()
        .container("some-handle")
        .stream_out("/src/path")
        .await
        .expect_err("stream out succeeded");
    assert!(err.to_string().contains("oh no!"));
}
