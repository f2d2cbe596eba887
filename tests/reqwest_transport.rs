//! End-to-end tests of the reqwest engine against a local mock server.

use transfer_http::transport::Property;
use transfer_http::{Dispatcher, Field, Request};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_not_found_is_http_error() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .with_header("content-type", "text/plain")
        .with_body("no such thing")
        .create_async()
        .await;

    let mut request = Request::new().unwrap();
    let exchange = request
        .get(&format!("{}/missing", server.url()), None)
        .await
        .unwrap();

    assert!(exchange.error.http_error);
    assert!(!exchange.error.transport_error);
    assert_eq!(exchange.error.error_code(), 404);
    assert_eq!(exchange.error.error_message(), Some("HTTP/1.1 404 Not Found"));
    assert_eq!(exchange.response.raw_body().as_ref(), b"no such thing");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_redirect_chain_reports_final_block() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/start")
        .with_status(301)
        .with_header("location", "/middle")
        .with_header("set-cookie", "hop=1; Path=/")
        .create_async()
        .await;
    server
        .mock("GET", "/middle")
        .with_status(302)
        .with_header("location", "/final")
        .create_async()
        .await;
    server
        .mock("GET", "/final")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("set-cookie", "session=abc; HttpOnly")
        .with_body(r#"{"ok":true}"#)
        .create_async()
        .await;

    let mut request = Request::new().unwrap();
    request.set_follow_redirects(true, Some(5));
    request
        .get(&format!("{}/start", server.url()), None)
        .await
        .unwrap();

    let response = request.response().unwrap();
    assert_eq!(response.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(response.header("location"), None);
    assert_eq!(response.cookie("hop"), Some("1"));
    assert_eq!(response.cookie("session"), Some("abc"));
    assert_eq!(response.body().as_json().unwrap()["ok"], true);
    assert_eq!(
        request.effective_url(),
        Some(format!("{}/final", server.url()))
    );
    assert_eq!(
        request.property(Property::RedirectCount).unwrap(),
        transfer_http::transport::InfoValue::Count(2)
    );
}

#[tokio::test]
async fn test_redirects_not_followed_by_default() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/moved")
        .with_status(302)
        .with_header("location", "/elsewhere")
        .create_async()
        .await;

    let mut request = Request::new().unwrap();
    request
        .get(&format!("{}/moved", server.url()), None)
        .await
        .unwrap();

    assert!(!request.is_error());
    assert_eq!(request.response().unwrap().status_code(), 302);
    assert_eq!(request.response().unwrap().header("Location"), Some("/elsewhere"));
}

#[tokio::test]
async fn test_redirect_limit_is_transport_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/loop")
        .with_status(302)
        .with_header("location", "/loop")
        .expect_at_least(1)
        .create_async()
        .await;

    let mut request = Request::new().unwrap();
    request.set_follow_redirects(true, Some(2));
    request
        .get(&format!("{}/loop", server.url()), None)
        .await
        .unwrap();

    assert_eq!(request.error_code(), 47);
    assert!(request.error_state().unwrap().transport_error);
}

#[tokio::test]
async fn test_form_post_and_cookies_on_the_wire() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/users")
        .match_header("content-type", "application/x-www-form-urlencoded")
        .match_header("cookie", "lang=en; theme=dark%20blue")
        .match_header("x-client", "tests")
        .match_body("name=Ann+Lee&admin=0")
        .with_status(201)
        .create_async()
        .await;

    let mut request = Request::with_base_url(&format!("{}/", server.url())).unwrap();
    request
        .set_header("X-Client", "tests")
        .set_cookie("lang", "en")
        .set_cookie("theme", "dark blue");
    request
        .post(
            "users",
            Field::map([("name", Field::from("Ann Lee")), ("admin", Field::from(false))]),
        )
        .await
        .unwrap();

    assert_eq!(request.response().unwrap().status_code(), 201);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_json_put_sends_content_length() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/items/7")
        .match_header("content-length", "13")
        .match_body(mockito::Matcher::JsonString(r#"{"qty":[1,2]}"#.into()))
        .with_status(204)
        .create_async()
        .await;

    let mut request = Request::with_base_url(&format!("{}/", server.url())).unwrap();
    request.set_header("Content-Type", "application/json");
    request
        .put("items/7", Field::map([("qty", Field::list([1, 2]))]))
        .await
        .unwrap();

    assert!(!request.is_error());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_request_echo_from_engine() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/echo")
        .match_query(mockito::Matcher::UrlEncoded("q".into(), "a b".into()))
        .with_status(200)
        .create_async()
        .await;

    let mut request = Request::new().unwrap();
    request.set_echo_request_headers(true);
    request
        .get(
            &format!("{}/echo", server.url()),
            Some(&Field::map([("q", "a b")])),
        )
        .await
        .unwrap();

    let echoed = request.request_headers().unwrap();
    assert_eq!(echoed.get("Request-Line"), Some("GET /echo?q=a+b HTTP/1.1"));
    assert!(!request.is_error());
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut request = Request::new().unwrap();
    request
        .get(&format!("http://127.0.0.1:{}/", port), None)
        .await
        .unwrap();

    let error = request.error_state().unwrap();
    assert!(error.transport_error);
    assert_eq!(error.error_code(), 7);
    assert!(error.error_message().is_some());
    assert_eq!(request.response().unwrap().status_line(), "");
}

#[tokio::test]
async fn test_dispatcher_against_server() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    for (path, status) in [("/a", 200), ("/b", 500), ("/c", 200)] {
        server
            .mock("GET", path)
            .match_header("accept", "application/json")
            .with_status(status)
            .create_async()
            .await;
    }

    let mut dispatcher = Dispatcher::with_base_url(&format!("{}/", server.url())).unwrap();
    dispatcher.set_default_header("Accept", "application/json");
    for path in ["a", "b", "c"] {
        dispatcher.add_get(path, None).unwrap();
    }

    let done = dispatcher.run_to_completion().await;
    assert_eq!(done.len(), 3);
    let failed: Vec<_> = done.iter().filter(|r| r.is_error()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_code(), 500);
    assert_eq!(failed[0].url().unwrap().path(), "/b");
}
