//! PocketBase adapter against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Server};
use portico_core::{Filter, GatewayError, Mutation, QueryDescriptor, QueryOptions, ReconnectConfig};
use portico_gateway::{
    BackendGateway, ChannelName, ObjectPath, PocketbaseProvider, RealtimeEvent, UploadOptions,
    EVENT_INSERT,
};
use serde_json::json;

fn gateway(url: &str) -> BackendGateway {
    let reconnect = ReconnectConfig {
        initial_ms: 60_000,
        max_ms: 60_000,
        multiplier: 1.0,
        jitter_ms: 0,
    };
    let provider = PocketbaseProvider::new(url, "users", Duration::from_secs(2), reconnect)
        .expect("provider");
    BackendGateway::new(Arc::new(provider))
}

#[tokio::test]
async fn query_maps_filter_sort_and_unaligned_window() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/collections/todos/records")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("filter".into(), "(done=false)".into()),
            Matcher::UrlEncoded("sort".into(), "-created".into()),
            Matcher::UrlEncoded("page".into(), "1".into()),
            Matcher::UrlEncoded("perPage".into(), "3".into()),
            Matcher::UrlEncoded("skipTotal".into(), "1".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"page":1,"perPage":3,"items":[{"id":"a"},{"id":"b"},{"id":"c"}]}"#)
        .create_async()
        .await;

    let query = QueryDescriptor::new(
        "todos",
        QueryOptions::new()
            .eq("done", false)
            .order_by("created", false)
            .offset(1)
            .limit(2),
    )
    .unwrap();
    let rows = gateway(&server.url()).query(&query).await.unwrap();

    assert_eq!(rows, vec![json!({"id": "b"}), json!({"id": "c"})]);
    mock.assert_async().await;
}

#[tokio::test]
async fn delete_lists_matches_then_deletes_each() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/collections/todos/records")
        .match_query(Matcher::UrlEncoded("filter".into(), "(done=true)".into()))
        .with_status(200)
        .with_body(r#"{"items":[{"id":"a","done":true},{"id":"b","done":true}]}"#)
        .create_async()
        .await;
    let delete_a = server
        .mock("DELETE", "/api/collections/todos/records/a")
        .with_status(204)
        .create_async()
        .await;
    let delete_b = server
        .mock("DELETE", "/api/collections/todos/records/b")
        .with_status(204)
        .create_async()
        .await;

    let mut filter = Filter::new();
    filter.insert("done".to_string(), json!(true));
    let removed = gateway(&server.url())
        .mutate(&Mutation::delete("todos", filter).unwrap())
        .await
        .unwrap();

    assert_eq!(removed.len(), 2);
    delete_a.assert_async().await;
    delete_b.assert_async().await;
}

#[tokio::test]
async fn upsert_falls_back_to_create_on_404() {
    let mut server = Server::new_async().await;
    server
        .mock("PATCH", "/api/collections/todos/records/x1")
        .with_status(404)
        .with_body(r#"{"code":404,"message":"The requested resource wasn't found."}"#)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/api/collections/todos/records")
        .match_body(Matcher::PartialJson(json!({"id": "x1"})))
        .with_status(200)
        .with_body(r#"{"id":"x1","title":"new"}"#)
        .create_async()
        .await;

    let rows = gateway(&server.url())
        .mutate(&Mutation::upsert("todos", vec![json!({"id": "x1", "title": "new"})]).unwrap())
        .await
        .unwrap();

    assert_eq!(rows, vec![json!({"id": "x1", "title": "new"})]);
    create.assert_async().await;
}

#[tokio::test]
async fn file_upload_patches_record_and_nested_paths_are_unsupported() {
    let mut server = Server::new_async().await;
    let upload = server
        .mock("PATCH", "/api/collections/avatars/records/rec1")
        .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
        .with_status(200)
        .with_body(r#"{"id":"rec1","file":"me_abc.png"}"#)
        .create_async()
        .await;

    let gateway = gateway(&server.url());
    let url = gateway
        .upload(
            &ObjectPath::new("avatars", "rec1/me.png").unwrap(),
            vec![1, 2, 3],
            &UploadOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(url, format!("{}/api/files/avatars/rec1/me.png", server.url()));
    upload.assert_async().await;

    let err = gateway
        .upload(
            &ObjectPath::new("avatars", "a/b/c.png").unwrap(),
            vec![],
            &UploadOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unsupported { .. }));
}

#[tokio::test]
async fn realtime_handshake_subscribes_and_decodes_records() {
    let mut server = Server::new_async().await;
    let stream_body = concat!(
        "id:c1\nevent:PB_CONNECT\ndata:{\"clientId\":\"c1\"}\n\n",
        "event:todos/*\ndata:{\"action\":\"create\",\"record\":{\"id\":\"9\"}}\n\n",
    );
    server
        .mock("GET", "/api/realtime")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(stream_body)
        .create_async()
        .await;
    let subscribe = server
        .mock("POST", "/api/realtime")
        .match_body(Matcher::Json(json!({"clientId": "c1", "subscriptions": ["todos/*"]})))
        .with_status(204)
        .create_async()
        .await;

    let gateway = gateway(&server.url());
    let mut connection = gateway
        .connect(&ChannelName::for_table("todos").unwrap())
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), connection.recv())
        .await
        .expect("event in time")
        .expect("stream open");

    assert_eq!(event, RealtimeEvent::new(EVENT_INSERT, json!({"id": "9"})));
    subscribe.assert_async().await;

    let err = connection
        .send(RealtimeEvent::new("typing", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unsupported { .. }));
}

#[tokio::test]
async fn health_endpoint_answers_ping() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/health")
        .with_status(200)
        .with_body(r#"{"code":200,"message":"API is healthy.","data":{}}"#)
        .create_async()
        .await;
    assert!(gateway(&server.url()).ping().await.is_ok());
}
