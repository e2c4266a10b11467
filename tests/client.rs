mod support;

use std::{io::Cursor, sync::Arc, time::Duration};

use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use rquest_transfer::{Body, ErrorCode, Method, Session, StatusCode, TaskState};
use support::{
    delegate::{Recorder, Seen},
    server,
};

#[tokio::test]
async fn auto_headers() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "GET");
        assert_eq!(req.headers()["connection"], "keep-alive");
        assert_eq!(
            req.headers()[USER_AGENT],
            concat!("rquest-transfer/", env!("CARGO_PKG_VERSION"))
        );
        assert!(req.headers().get("accept-language").is_none());
        http::Response::new(b"hello".to_vec())
    });

    let url = server.url("/1");
    let completed = Session::new().get(&url).send().await.unwrap();

    assert_eq!(completed.status(), Some(StatusCode::OK));
    assert_eq!(completed.response().unwrap().url().as_str(), url);
    assert_eq!(completed.text(), "hello");
}

#[tokio::test]
async fn session_and_request_headers() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()[ACCEPT], "text/plain");
        assert_eq!(req.headers()["x-session"], "yes");
        assert_eq!(req.headers()[USER_AGENT], "custom-agent");
        assert_eq!(req.headers()["accept-language"], "de");
        http::Response::default()
    });

    let mut headers = http::HeaderMap::new();
    headers.insert(ACCEPT, "*/*".parse().unwrap());
    headers.insert("x-session", "yes".parse().unwrap());
    let session = Session::builder()
        .default_headers(headers)
        .user_agent("custom-agent")
        .accept_language("de")
        .build()
        .unwrap();

    let completed = session
        .get(server.url("/headers"))
        .header(ACCEPT, "text/plain")
        .send()
        .await
        .unwrap();
    assert_eq!(completed.status(), Some(StatusCode::OK));
}

#[tokio::test]
async fn post_bytes() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "POST");
        assert_eq!(req.headers()["content-length"], "11");
        assert_eq!(req.headers()[CONTENT_TYPE], "application/x-www-form-urlencoded");
        assert!(req.headers().get("expect").is_none());
        http::Response::new(req.into_body())
    });

    let completed = Session::new()
        .post(server.url("/post"))
        .body("hello world")
        .send()
        .await
        .unwrap();
    assert_eq!(completed.text(), "hello world");
}

#[tokio::test]
async fn post_stream_is_chunked() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["transfer-encoding"], "chunked");
        assert!(req.headers().get("content-length").is_none());
        http::Response::new(req.into_body())
    });

    let data = vec![b'x'; 100_000];
    let completed = Session::new()
        .put(server.url("/upload"))
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(Body::reader(Cursor::new(data.clone())))
        .send()
        .await
        .unwrap();
    assert_eq!(completed.body().len(), data.len());
}

#[tokio::test]
async fn post_file() {
    let _ = env_logger::try_init();

    let dir = std::env::temp_dir().join(format!("rquest-transfer-upload-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("body.txt");
    std::fs::write(&path, "from a file").unwrap();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["content-length"], "11");
        http::Response::new(req.into_body())
    });

    let completed = Session::new()
        .post(server.url("/file"))
        .body(Body::file(&path))
        .send()
        .await
        .unwrap();
    assert_eq!(completed.text(), "from a file");

    let err = Session::new()
        .post(server.url("/file"))
        .body(Body::file(dir.join("missing.txt")))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileDoesNotExist);
}

#[tokio::test]
async fn head_has_no_body() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "HEAD");
        http::Response::builder()
            .header("content-length", "5")
            .body(Vec::new())
            .unwrap()
    });

    let completed = Session::new().head(server.url("/head")).send().await.unwrap();
    assert_eq!(completed.status(), Some(StatusCode::OK));
    assert!(completed.body().is_empty());
    assert_eq!(completed.response().unwrap().expected_content_length(), Some(5));
}

#[tokio::test]
async fn error_status_is_not_an_error() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        http::Response::builder()
            .status(404)
            .body(b"not here".to_vec())
            .unwrap()
    });

    let completed = Session::new().get(server.url("/404")).send().await.unwrap();
    assert_eq!(completed.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(completed.text(), "not here");
}

#[tokio::test]
async fn chunked_response() {
    let _ = env_logger::try_init();

    let server = server::low_level_with_response(|_head, io| {
        Box::new(async move {
            use tokio::io::AsyncWriteExt;
            io.write_all(
                b"HTTP/1.1 200 OK\r\n\
                Transfer-Encoding: chunked\r\n\
                Content-Type: text/plain; charset=utf-8\r\n\
                \r\n\
                5\r\nhello\r\n\
                6\r\n world\r\n\
                0\r\n\r\n",
            )
            .await
            .unwrap();
            io.shutdown().await.unwrap();
        })
    });

    let completed = Session::new().get(server.url("/chunked")).send().await.unwrap();
    let response = completed.response().unwrap();
    assert_eq!(response.mime_type().as_deref(), Some("text/plain"));
    assert_eq!(response.text_encoding_name().as_deref(), Some("utf-8"));
    assert_eq!(completed.text(), "hello world");
}

#[tokio::test]
async fn connection_refused() {
    let _ = env_logger::try_init();

    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let err = Session::new()
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CannotConnectToHost);
    assert!(err.is_connect());
}

#[tokio::test]
async fn switching_protocols_is_a_bad_response() {
    let _ = env_logger::try_init();

    let server = server::low_level_with_response(|_head, io| {
        Box::new(async move {
            use tokio::io::AsyncWriteExt;
            let _ = io
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: x\r\n\r\nxyz")
                .await;
            let _ = io.shutdown().await;
        })
    });
    let ok = server::http(move |_req| async move { http::Response::new(b"ok".to_vec()) });

    let session = Session::new();
    let err = tokio::time::timeout(Duration::from_secs(5), session.get(server.url("/upgrade")).send())
        .await
        .expect("task completes")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadServerResponse);

    // the session keeps working afterwards
    let completed = tokio::time::timeout(Duration::from_secs(5), session.get(ok.url("/")).send())
        .await
        .expect("task completes")
        .unwrap();
    assert_eq!(completed.text(), "ok");
}

#[tokio::test]
async fn configuration_errors() {
    let _ = env_logger::try_init();

    let session = Session::new();

    let err = session.get("gopher://example.com/").send().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnsupportedUrl);

    let err = session
        .request(Method::GET, "http://127.0.0.1:1/")
        .body("not allowed")
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataLengthExceedsMaximum);
}

#[tokio::test]
async fn delegate_sees_response_and_data() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        http::Response::new(vec![b'a'; 64 * 1024])
    });

    let session = Session::new();
    let recorder = Arc::new(Recorder::default());
    let request = session.get(server.url("/data")).build().unwrap();
    let task = session.data_task_with_delegate(request, recorder.clone());
    assert_eq!(task.state(), TaskState::Suspended);
    task.resume();

    assert_eq!(recorder.completed().await, None);
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(task.bytes_received(), 64 * 1024);
    assert_eq!(task.bytes_expected_to_receive(), Some(64 * 1024));
    assert_eq!(recorder.body().len(), 64 * 1024);

    let seen = recorder.seen();
    assert_eq!(seen.first(), Some(&Seen::Response(200)));
    assert_eq!(seen.last(), Some(&Seen::Complete(None)));
}

#[tokio::test]
async fn delegate_can_cancel_on_response() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(b"body".to_vec()) });

    let session = Session::new();
    let recorder = Arc::new(Recorder::default().cancel_on_response());
    let request = session.get(server.url("/cancel")).build().unwrap();
    let task = session.data_task_with_delegate(request, recorder.clone());
    task.resume();

    assert_eq!(recorder.completed().await, Some(ErrorCode::Cancelled));
    assert!(recorder.body().is_empty());
    assert_eq!(task.error(), Some(ErrorCode::Cancelled));
}

#[tokio::test]
async fn download_task_writes_file() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(b"downloaded".to_vec()) });

    let dir = std::env::temp_dir().join(format!("rquest-transfer-download-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("out.txt");
    std::fs::write(&path, "stale contents that are longer").unwrap();

    let session = Session::new();
    let recorder = Arc::new(Recorder::default());
    let request = session.get(server.url("/download")).build().unwrap();
    let task = session.download_task_with_delegate(request, &path, recorder.clone());
    task.resume();

    assert_eq!(recorder.completed().await, None);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "downloaded");
    assert!(recorder.seen().contains(&Seen::Downloaded(path.clone())));
}

#[tokio::test]
async fn task_wait_returns_outcome() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(b"waited".to_vec()) });

    let session = Session::new();
    let task = session.data_task(session.get(server.url("/wait")).build().unwrap());
    task.resume();
    let completed = task.wait().await.unwrap();
    assert_eq!(completed.status(), Some(StatusCode::OK));
    assert_eq!(task.current_request().url().path(), "/wait");
    assert_eq!(task.response().unwrap().status(), Some(StatusCode::OK));
}
