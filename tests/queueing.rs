mod common;

use common::{debug_lines, harness, public};
use futures::future::join_all;
use labrinth_rest::{RawResponse, RestOptions, ScriptedReply};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn delayed(ms: u64, response: RawResponse) -> ScriptedReply {
    ScriptedReply::Delayed(Duration::from_millis(ms), Box::new(response.into()))
}

#[tokio::test(start_paused = true)]
async fn same_bucket_requests_start_in_enqueue_order() {
    let h = harness(RestOptions::default());
    for n in 0..3 {
        h.transport.push(delayed(100, RawResponse::new(200).with_json(json!({ "n": n }))));
    }

    let requests =
        (0..3).map(|n| h.rest.get("/project/abc", public().query("n", n.to_string())));
    let results = join_all(requests).await;

    for (n, result) in results.into_iter().enumerate() {
        let response = result.unwrap();
        assert_eq!(response.body.as_json(), Some(&json!({ "n": n })));
    }

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 3);
    for (n, call) in calls.iter().enumerate() {
        assert!(call.request.url.ends_with(&format!("/v2/project/abc?n={}", n)));
    }
    // each request starts only after the previous one completed
    assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_millis(100));
    assert!(calls[2].at.duration_since(calls[1].at) >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn different_buckets_run_concurrently() {
    let h = harness(RestOptions::default());
    h.transport.push(delayed(100, RawResponse::new(200)));
    h.transport.push(delayed(100, RawResponse::new(200)));

    let start = Instant::now();
    let (a, b) = tokio::join!(
        h.rest.get("/project/abc", public()),
        h.rest.get("/project/xyz", public())
    );
    a.unwrap();
    b.unwrap();

    let calls = h.transport.calls();
    assert_eq!(calls[0].at, calls[1].at);
    assert_eq!(start.elapsed(), Duration::from_millis(100));
    assert_eq!(h.rest.buckets().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_waits_for_reset_plus_offset() {
    let h = harness(RestOptions::default());
    h.transport.push(RawResponse::new(200).with_rate_limit(300, 0, 2.0));
    h.transport.push(RawResponse::new(200));
    h.transport.push(RawResponse::new(200));

    h.rest.get("/project/abc", public()).await.unwrap();
    h.rest.get("/project/abc", public()).await.unwrap();

    let calls = h.transport.calls();
    assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_millis(2_050));
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(2_050)]);

    let limits = h.events.rate_limits();
    assert_eq!(limits.len(), 1);
    assert!(!limits[0].global);
    assert_eq!(limits[0].limit, Some(300));
    assert_eq!(limits[0].route, "/project/:id");
    assert_eq!(limits[0].major_parameter, "abc");
    assert_eq!(limits[0].time_to_reset, Duration::from_millis(2_050));

    assert!(debug_lines(&h.events)
        .contains(&"[REST GET:/project/:id:abc] Waiting 2050ms for rate limit to pass".to_string()));

    // another project id is its own bucket and is not held back
    let before = Instant::now();
    h.rest.get("/project/other", public()).await.unwrap();
    assert_eq!(before.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn missing_rate_limit_headers_do_not_block() {
    let h = harness(RestOptions::default());
    for _ in 0..5 {
        h.rest.get("/tag/category", public()).await.unwrap();
    }
    assert!(h.sleeper.calls().is_empty());
    let bucket = &h.rest.buckets()[0];
    assert_eq!(bucket.limit, None);
    assert_eq!(bucket.remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn global_quota_blocks_every_bucket() {
    let h = harness(RestOptions::builder().global_requests_per_second(2).build().unwrap());
    let start = Instant::now();

    h.rest.get("/project/a", public()).await.unwrap();
    h.rest.get("/project/b", public()).await.unwrap();
    h.rest.get("/project/c", public()).await.unwrap();

    let calls = h.transport.calls();
    assert_eq!(calls[1].at.duration_since(start), Duration::ZERO);
    assert!(calls[2].at.duration_since(start) >= Duration::from_millis(1_050));
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(1_050)]);

    let limits = h.events.rate_limits();
    assert_eq!(limits.len(), 1);
    assert!(limits[0].global);
    assert_eq!(limits[0].limit, Some(2));
}

#[tokio::test(start_paused = true)]
async fn global_waiters_share_one_delay() {
    let h = harness(RestOptions::builder().global_requests_per_second(1).build().unwrap());
    let start = Instant::now();
    h.rest.get("/project/a", public()).await.unwrap();

    let (b, c) = tokio::join!(
        h.rest.get("/project/b", public()),
        h.rest.get("/project/c", public())
    );
    b.unwrap();
    c.unwrap();

    // b and c waited on one shared delay; c then waited again for the next window
    let sleeps = h.sleeper.calls();
    assert_eq!(sleeps, vec![Duration::from_millis(1_050), Duration::from_millis(1_050)]);

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].at.duration_since(start), Duration::from_millis(1_050));
    assert_eq!(calls[2].at.duration_since(start), Duration::from_millis(2_100));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_a_queued_request() {
    let h = harness(RestOptions::default());
    h.transport.push(delayed(1_000, RawResponse::new(200)));

    let token = CancellationToken::new();
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (first, second, ()) = tokio::join!(
        h.rest.get("/project/abc", public()),
        h.rest.get("/project/abc", public().signal(token.clone())),
        cancel
    );

    first.unwrap();
    assert!(second.unwrap_err().is_aborted());
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_an_in_flight_request() {
    let h = harness(RestOptions::default());
    h.transport.push(ScriptedReply::Hang);

    let token = CancellationToken::new();
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (result, ()) =
        tokio::join!(h.rest.get("/search", public().signal(token.clone())), cancel);

    assert!(result.unwrap_err().is_aborted());
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn already_cancelled_requests_never_reach_the_network() {
    let h = harness(RestOptions::default());
    let token = CancellationToken::new();
    token.cancel();

    let err = h.rest.get("/search", public().signal(token)).await.unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_buckets_are_swept() {
    let h = harness(RestOptions::default());
    h.transport.push(RawResponse::new(200).with_rate_limit(10, 0, 1.0));

    h.rest.get("/project/abc", public()).await.unwrap();
    h.rest.get("/search", public()).await.unwrap();

    assert_eq!(h.rest.sweep_idle_buckets(), 1);
    assert_eq!(h.rest.buckets()[0].key, "GET:/project/:id:abc");

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(h.rest.sweep_idle_buckets(), 1);
    assert!(h.rest.buckets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_evicts_idle_buckets() {
    let options =
        RestOptions::builder().bucket_sweep_interval(Duration::from_secs(60)).build().unwrap();
    let h = harness(options);

    h.rest.get("/search", public()).await.unwrap();
    assert_eq!(h.rest.buckets().len(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(h.rest.buckets().is_empty());
}
