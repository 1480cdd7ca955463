use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Client, Method, Request, StatusCode};
use tokio::sync::oneshot;

use cluster::{http, Configuration, ConsensusServer, KvStateMachine, TcpNetworkListener};

async fn dev_server() -> Arc<ConsensusServer> {
    let config = Configuration {
        dev_mode: true,
        ..Default::default()
    };
    let listener = TcpNetworkListener::bind("127.0.0.1:0", None).await.unwrap();
    let server = ConsensusServer::setup(&config, Arc::new(listener), KvStateMachine::new())
        .await
        .unwrap();
    server.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    Arc::new(server)
}

async fn call(method: Method, uri: String, body: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = Client::new().request(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn test_api_routes() {
    let server = dev_server().await;
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let api = tokio::spawn(http::serve(listener, server.clone(), async move {
        let _ = stopped.await;
    }));

    let (status, body) = call(Method::GET, format!("{}/info", base), "").await;
    assert_eq!(status, StatusCode::OK);
    let info: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(info["role"], "Leader");
    assert_eq!(info["address"], server.address());
    assert_eq!(info["members"].as_array().unwrap().len(), 1);

    let (status, body) = call(Method::GET, format!("{}/metrics", base), "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("applied_entries"));

    let (status, _) = call(Method::POST, format!("{}/join", base), "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(Method::GET, format!("{}/nothing/here", base), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Removing a member that was never added is already in effect.
    let (status, _) = call(
        Method::DELETE,
        format!("{}/remove/127.0.0.1:1", base),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let _ = stop.send(());
    api.await.unwrap().unwrap();
    server.shutdown().await.unwrap();
}
