mod common;

use std::collections::HashMap;

use bytes::Bytes;
use common::{harness, native_fixture, native_site};
use freebox_spider::{Spider, SpiderDispatcher};
use serde_json::{json, Value};

fn parse(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|e| panic!("not json ({e}): {text}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_native_spider_capabilities() {
    let library = native_fixture();
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let h = harness(dir.path());

    let spider = h
        .loader
        .get_spider(&native_site("demo", "Demo", &library, "hello"))
        .await;
    assert_eq!(spider.kind(), "native");
    assert_eq!(h.notifier.count(), 0);

    let home = parse(&spider.home_content(true).await);
    assert_eq!(home["init"], json!(["hello"]));
    assert_eq!(home["args"], json!([true]));

    let search = parse(&spider.search_content("key", false, Some("2")).await);
    assert_eq!(search["args"], json!(["key", false, "2"]));
    let play = parse(&spider.player_content("line", "ep", &["qq".to_string()]).await);
    assert_eq!(play["args"], json!(["line", "ep", ["qq"]]));

    assert!(spider.manual_video_check().await);
    assert!(spider.is_video_format("http://v.io/a.m3u8").await);
    assert!(!spider.is_video_format("http://v.io/a.html").await);
    // Methods the library does not answer degrade to empty.
    assert_eq!(spider.detail_content(&["1".to_string()]).await, "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_native_proxy_through_dispatcher() {
    let library = native_fixture();
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let h = harness(dir.path());
    h.loader
        .get_spider(&native_site("px", "Demo", &library, ""))
        .await;

    let dispatcher = SpiderDispatcher::new(h.loader.clone());
    let mut params = HashMap::new();
    params.insert("url".to_string(), "http://a/b".to_string());
    let res = dispatcher.proxy_response(&params).await;
    assert_eq!(res.len(), 4);
    let reply = res.as_reply().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.content_type, "text/plain");
    assert_eq!(reply.body, Bytes::from_static(b"native"));
    assert_eq!(reply.headers.as_ref().unwrap()["X-Native"], "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_native_spider_is_notified() {
    let library = native_fixture();
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let h = harness(dir.path());

    let spider = h
        .loader
        .get_spider(&native_site("nope", "Missing", &library, ""))
        .await;
    assert!(spider.is_empty());
    let error = h.notifier.last_error().unwrap();
    assert!(error.contains("module load failed"), "got {error}");
    assert!(error.contains("Missing"), "got {error}");
    // The module itself loaded and stays shared.
    assert_eq!(h.loader.module_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destroyed_native_spider_degrades() {
    let library = native_fixture();
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let h = harness(dir.path());
    let spider = h
        .loader
        .get_spider(&native_site("gone", "Demo", &library, ""))
        .await;
    assert!(spider.manual_video_check().await);

    h.loader.destroy().await;
    assert_eq!(spider.home_content(false).await, "");
    assert!(!spider.manual_video_check().await);
    // A second teardown does not release the instance again.
    spider.destroy().await;
}
