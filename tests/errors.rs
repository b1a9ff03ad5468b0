mod common;

use common::{harness, public};
use labrinth_rest::{
    ApiErrorCode, RawFile, RawResponse, RejectOnRateLimit, RequestData, RestEvent, RestOptions,
    ScriptedReply,
};
use serde_json::json;
use std::time::Duration;

fn authed() -> RestOptions {
    RestOptions::builder().auth_token("mrp_stale").build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn unauthorized_clears_the_token() {
    let h = harness(authed());
    h.transport.push(
        RawResponse::new(401)
            .with_json(json!({ "error": "unauthorized", "description": "Authentication Error" })),
    );

    let err = h.rest.get("/user", RequestData::new()).await.unwrap_err();
    let api = err.as_api().expect("api error");
    assert_eq!(api.status, 401);
    assert_eq!(api.code, ApiErrorCode::Text("unauthorized".into()));
    assert_eq!(api.message, "Authentication Error");
    assert_eq!(api.name(), "ApiError[unauthorized]");
    assert!(!h.rest.has_token());

    // the next authenticated call fails before touching the network
    let err = h.rest.get("/user", RequestData::new()).await.unwrap_err();
    assert!(err.is_missing_credential());
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_unauthorized_keeps_a_replaced_token() {
    let h = harness(authed());
    h.transport.push(ScriptedReply::Delayed(
        Duration::from_millis(500),
        Box::new(RawResponse::new(401).into()),
    ));

    let refresh = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.rest.set_token("mrp_fresh");
    };
    let (result, ()) = tokio::join!(h.rest.get("/user", RequestData::new()), refresh);

    assert_eq!(result.unwrap_err().status(), Some(401));
    assert!(h.rest.has_token());

    h.transport.push(RawResponse::new(200));
    h.rest.get("/user", RequestData::new()).await.unwrap();
    let calls = h.transport.calls();
    assert_eq!(calls[0].request.headers.get("authorization").unwrap(), "mrp_stale");
    assert_eq!(calls[1].request.headers.get("authorization").unwrap(), "mrp_fresh");
}

#[tokio::test(start_paused = true)]
async fn unauthorized_on_a_public_request_keeps_the_token() {
    let h = harness(authed());
    h.transport.push(RawResponse::new(401));

    let err = h.rest.get("/search", public()).await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert!(h.rest.has_token());
}

#[tokio::test(start_paused = true)]
async fn forbidden_keeps_the_token() {
    let h = harness(authed());
    h.transport.push(RawResponse::new(403));

    let err = h.rest.delete("/project/abc", RequestData::new()).await.unwrap_err();
    assert!(err.is_api());
    assert!(h.rest.has_token());
}

#[tokio::test(start_paused = true)]
async fn api_errors_are_flattened_with_the_request_body() {
    let h = harness(authed());
    h.transport.push(RawResponse::new(400).with_json(json!({
        "code": "invalid_input",
        "message": "Invalid input",
        "errors": {
            "fields": {
                "title": { "code": "too_small", "message": "Title is too short" },
                "gallery": { "0": { "url": { "_errors": [{ "code": "url", "message": "Not a URL" }] } } }
            }
        }
    })));

    let body = json!({ "title": "x" });
    let err = h
        .rest
        .patch("/project/abc", RequestData::new().json(body.clone()))
        .await
        .unwrap_err();
    let api = err.as_api().expect("api error");
    assert_eq!(api.status, 400);
    assert_eq!(api.code, ApiErrorCode::Text("invalid_input".into()));
    assert_eq!(
        api.field_errors(),
        vec![
            "fields.title[too_small]: Title is too short".to_string(),
            "fields.gallery[0].url[url]: Not a URL".to_string(),
        ]
    );
    assert_eq!(
        api.message,
        "Invalid input\nfields.title[too_small]: Title is too short\nfields.gallery[0].url[url]: Not a URL"
    );
    assert_eq!(api.request_json, Some(body));
    assert!(api.url.ends_with("/v2/project/abc"));
    assert!(err.to_string().starts_with("ApiError[invalid_input] 400 PATCH "));
}

#[tokio::test(start_paused = true)]
async fn api_errors_record_attached_files() {
    let h = harness(authed());
    h.transport.push(RawResponse::new(400).with_json(json!({ "code": 400 })));

    let data = RequestData::new()
        .json(json!({ "name": "1.0.0" }))
        .file(RawFile::new("mod.jar", &b"PK"[..]));
    let err = h.rest.post("/version", data).await.unwrap_err();
    let api = err.as_api().expect("api error");
    assert_eq!(api.code, ApiErrorCode::Number(400));
    assert_eq!(api.message, "Unknown Error");
    assert_eq!(api.request_files, vec!["mod.jar".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn not_found_without_a_body_uses_the_status_as_code() {
    let h = harness(RestOptions::default());
    h.transport.push(RawResponse::new(404));

    let err = h.rest.get("/project/missing", public()).await.unwrap_err();
    let api = err.as_api().expect("api error");
    assert_eq!(api.code, ApiErrorCode::Number(404));
    assert_eq!(api.message, "Unknown Error");
}

#[tokio::test(start_paused = true)]
async fn rejected_prefixes_fail_instead_of_waiting() {
    let options = RestOptions::builder().reject_routes(["/PROJECT"]).build().unwrap();
    let h = harness(options);
    h.transport.push(RawResponse::new(200).with_rate_limit(10, 0, 5.0));
    h.transport.push(RawResponse::new(200).with_rate_limit(10, 0, 1.0));
    h.transport.push(RawResponse::new(200));

    h.rest.get("/project/abc", public()).await.unwrap();
    let err = h.rest.get("/project/abc", public()).await.unwrap_err();
    let rate_limit = err.as_rate_limit().expect("rate limit error");
    assert_eq!(rate_limit.name(), "RateLimitError[/project/:id]");
    assert_eq!(rate_limit.time_to_reset(), Duration::from_millis(5_050));
    assert!(!rate_limit.is_global());
    assert_eq!(h.transport.call_count(), 1);

    // routes outside the prefix list still wait
    h.rest.get("/search", public()).await.unwrap();
    h.rest.get("/search", public()).await.unwrap();
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(1_050)]);
    assert_eq!(h.transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn predicates_see_the_rate_limit_info() {
    let options = RestOptions::builder()
        .global_requests_per_second(1)
        .reject_on_rate_limit(RejectOnRateLimit::predicate(|info| info.global))
        .build()
        .unwrap();
    let h = harness(options);

    h.rest.get("/project/a", public()).await.unwrap();
    let err = h.rest.get("/project/b", public()).await.unwrap_err();
    let rate_limit = err.as_rate_limit().expect("rate limit error");
    assert!(rate_limit.is_global());
    assert_eq!(rate_limit.info.limit, Some(1));
    assert_eq!(rate_limit.time_to_reset(), Duration::from_millis(1_050));
    assert!(h.sleeper.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn async_predicates_can_decline() {
    let options = RestOptions::builder()
        .reject_on_rate_limit(RejectOnRateLimit::async_predicate(|info| async move {
            info.time_to_reset > Duration::from_secs(60)
        }))
        .build()
        .unwrap();
    let h = harness(options);
    h.transport.push(RawResponse::new(200).with_rate_limit(10, 0, 2.0));

    h.rest.get("/project/abc", public()).await.unwrap();
    h.rest.get("/project/abc", public()).await.unwrap();
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(2_050)]);
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_emit_periodic_warnings() {
    let options = RestOptions::builder()
        .auth_token("mrp_token")
        .invalid_request_warning_interval(2)
        .build()
        .unwrap();
    let h = harness(options);
    h.transport.push(RawResponse::new(403));
    h.transport.push(RawResponse::new(404));
    h.transport.push(RawResponse::new(403));

    for route in ["/project/a", "/project/b", "/project/c"] {
        assert!(h.rest.delete(route, RequestData::new()).await.is_err());
    }

    let warnings: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            RestEvent::InvalidRequestWarning(warning) => Some(warning),
            _ => None,
        })
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].count, 2);
    assert_eq!(warnings[0].remaining_time, Duration::from_secs(600));
    assert_eq!(h.rest.invalid_request_count(), 2);
}
