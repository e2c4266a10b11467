//! Sessions driven by a scripted engine instead of sockets, and the
//! built-in engine driven by hand.

mod support;

use std::{
    collections::VecDeque,
    io::{Cursor, Read},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use rquest_transfer::{
    engine::{
        Action, BodyLength, Callbacks, Completion, Engine, EngineEvent, FillResult, HandleId,
        MioEngine, PauseState, Perform, Progress, ResultCode, SeekResult, TimerRequest,
        TransferConfig,
    },
    Body, ErrorCode, Session, Task, TaskDelegate,
};
use support::server;

#[derive(Debug, Default)]
struct Log {
    configs: Vec<TransferConfig>,
    seeks: Vec<SeekResult>,
}

/// Reads the whole request body, rewinds it, reads it again and answers with
/// what the second read produced.
struct EchoEngine {
    log: Arc<Mutex<Log>>,
    headless: bool,
    pending: Vec<HandleId>,
    events: VecDeque<EngineEvent>,
    completions: VecDeque<Completion>,
}

impl EchoEngine {
    fn new(log: Arc<Mutex<Log>>) -> EchoEngine {
        EchoEngine {
            log,
            headless: false,
            pending: Vec::new(),
            events: VecDeque::new(),
            completions: VecDeque::new(),
        }
    }

    /// Answers with body bytes but never a head.
    fn headless(log: Arc<Mutex<Log>>) -> EchoEngine {
        EchoEngine {
            headless: true,
            ..EchoEngine::new(log)
        }
    }

    fn read_body(id: HandleId, cb: &mut dyn Callbacks) -> Vec<u8> {
        let mut body = Vec::new();
        let mut buf = [0; 7];
        loop {
            match cb.on_read(id, &mut buf) {
                FillResult::Bytes(0) => return body,
                FillResult::Bytes(n) => body.extend_from_slice(&buf[..n]),
                FillResult::Abort | FillResult::Pause => return body,
            }
        }
    }

    fn run(&mut self, id: HandleId, cb: &mut dyn Callbacks) {
        let first = Self::read_body(id, cb);
        let body = if first.is_empty() {
            first
        } else {
            let seek = cb.on_seek(id, 0);
            self.log.lock().unwrap().seeks.push(seek);
            if seek == SeekResult::Ok {
                Self::read_body(id, cb)
            } else {
                Vec::new()
            }
        };

        let length = format!("Content-Length: {}\r\n", body.len());
        let head = if self.headless {
            Vec::new()
        } else {
            vec!["HTTP/1.1 200 OK\r\n", length.as_str(), "\r\n"]
        };
        for line in head {
            if cb.on_header(id, line.as_bytes(), Some(body.len() as u64)) == Action::Abort {
                return self.finish(id, ResultCode::AbortedByCallback);
            }
        }
        if !body.is_empty() && cb.on_write(id, &body) == Action::Abort {
            return self.finish(id, ResultCode::AbortedByCallback);
        }
        self.finish(id, ResultCode::Ok);
    }

    fn finish(&mut self, handle: HandleId, result: ResultCode) {
        self.completions.push_back(Completion {
            handle,
            result,
            os_error: None,
        });
    }
}

impl Engine for EchoEngine {
    fn add_handle(&mut self, handle: HandleId, config: TransferConfig) {
        self.log.lock().unwrap().configs.push(config);
        self.pending.push(handle);
        self.events
            .push_back(EngineEvent::Timer(TimerRequest::Immediate));
    }

    fn remove_handle(&mut self, handle: HandleId) {
        self.pending.retain(|&id| id != handle);
    }

    fn set_pause(&mut self, _handle: HandleId, _pause: PauseState) {}

    fn perform(&mut self, perform: Perform, cb: &mut dyn Callbacks) -> usize {
        if perform == Perform::Timeout {
            for id in std::mem::take(&mut self.pending) {
                self.run(id, cb);
            }
        }
        self.pending.len()
    }

    fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }
}

fn session(log: &Arc<Mutex<Log>>) -> Session {
    let log = log.clone();
    Session::builder()
        .engine(move || EchoEngine::new(log))
        .build()
        .unwrap()
}

#[tokio::test]
async fn configures_the_engine() {
    let _ = env_logger::try_init();

    let log = Arc::new(Mutex::new(Log::default()));
    let session = session(&log);
    session
        .post("http://engine.test/form")
        .body("a=1")
        .send()
        .await
        .unwrap();

    let log = log.lock().unwrap();
    let config = &log.configs[0];
    assert_eq!(config.method, "POST");
    assert_eq!(config.url.as_str(), "http://engine.test/form");
    assert_eq!(config.body_length, BodyLength::Length(3));
    assert!(config.decompress);
    assert!(!config.no_body);
    assert!(config.headers.iter().any(|h| h == "Expect:"));
    assert!(config
        .headers
        .iter()
        .any(|h| h == "Content-Type: application/x-www-form-urlencoded"));
}

#[tokio::test]
async fn byte_bodies_rewind() {
    let _ = env_logger::try_init();

    let log = Arc::new(Mutex::new(Log::default()));
    let completed = session(&log)
        .put("http://engine.test/upload")
        .body("a body longer than one read")
        .send()
        .await
        .unwrap();

    assert_eq!(completed.text(), "a body longer than one read");
    assert_eq!(log.lock().unwrap().seeks, vec![SeekResult::Ok]);
}

#[tokio::test]
async fn streams_can_not_rewind_without_a_delegate() {
    let _ = env_logger::try_init();

    let log = Arc::new(Mutex::new(Log::default()));
    let completed = session(&log)
        .put("http://engine.test/upload")
        .body(Body::reader(Cursor::new(b"streamed".to_vec())))
        .send()
        .await
        .unwrap();

    assert!(completed.body().is_empty());
    assert_eq!(log.lock().unwrap().seeks, vec![SeekResult::Fail]);
}

struct Restreamer;

impl TaskDelegate for Restreamer {
    fn need_new_body_stream(&self, _task: &Task) -> Option<Box<dyn Read + Send>> {
        Some(Box::new(Cursor::new(b"second stream".to_vec())))
    }
}

#[tokio::test]
async fn delegate_provides_a_new_stream() {
    let _ = env_logger::try_init();

    let log = Arc::new(Mutex::new(Log::default()));
    let session = Session::builder()
        .engine({
            let log = log.clone();
            move || EchoEngine::new(log)
        })
        .delegate(Arc::new(Restreamer))
        .build()
        .unwrap();

    let request = session
        .put("http://engine.test/upload")
        .body(Body::reader(Cursor::new(b"first stream".to_vec())))
        .build()
        .unwrap();
    let completed = session.execute(request).await.unwrap();

    assert_eq!(completed.text(), "second stream");
    assert_eq!(log.lock().unwrap().seeks, vec![SeekResult::Ok]);
}

#[tokio::test]
async fn body_before_head_fails_the_task() {
    let _ = env_logger::try_init();

    let log = Arc::new(Mutex::new(Log::default()));
    let session = Session::builder()
        .engine({
            let log = log.clone();
            move || EchoEngine::headless(log)
        })
        .build()
        .unwrap();

    let err = session
        .put("http://engine.test/upload")
        .body("no head")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_parse());
    assert_eq!(err.code(), ErrorCode::BadServerResponse);

    // the work queue survives
    let err = session
        .put("http://engine.test/upload")
        .body("again")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_parse());
    assert_eq!(log.lock().unwrap().configs.len(), 2);
}

/// Pauses on the first body chunk and records every delivery.
#[derive(Default)]
struct Pausing {
    writes: Vec<Vec<u8>>,
    paused_once: bool,
}

impl Callbacks for Pausing {
    fn on_header(&mut self, _: HandleId, _: &[u8], _: Option<u64>) -> Action {
        Action::Proceed
    }

    fn on_write(&mut self, _: HandleId, data: &[u8]) -> Action {
        self.writes.push(data.to_vec());
        if self.paused_once {
            Action::Proceed
        } else {
            self.paused_once = true;
            Action::Pause
        }
    }

    fn on_read(&mut self, _: HandleId, _: &mut [u8]) -> FillResult {
        FillResult::Bytes(0)
    }

    fn on_seek(&mut self, _: HandleId, _: u64) -> SeekResult {
        SeekResult::Ok
    }

    fn on_progress(&mut self, _: HandleId, _: Progress) {}
}

#[test]
fn paused_download_holds_its_chunk() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(b"hello".to_vec()) });

    let mut engine = MioEngine::new();
    let handle = HandleId::new(0);
    engine.add_handle(
        handle,
        TransferConfig {
            url: server.url("/paused").parse().unwrap(),
            method: "GET".into(),
            headers: Vec::new(),
            body_length: BodyLength::NoBody,
            no_body: false,
            decompress: false,
        },
    );

    let mut callbacks = Pausing::default();
    let deadline = Instant::now() + Duration::from_secs(5);
    while callbacks.writes.is_empty() {
        assert!(Instant::now() < deadline, "no body delivered");
        engine.perform(Perform::Timeout, &mut callbacks);
        thread::sleep(Duration::from_millis(5));
    }

    for _ in 0..20 {
        engine.perform(Perform::Timeout, &mut callbacks);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(callbacks.writes.len(), 1);
    assert!(engine.next_completion().is_none());

    engine.set_pause(handle, PauseState::default());
    let completion = loop {
        assert!(Instant::now() < deadline, "transfer did not finish");
        engine.perform(Perform::Timeout, &mut callbacks);
        if let Some(completion) = engine.next_completion() {
            break completion;
        }
        thread::sleep(Duration::from_millis(5));
    };

    assert_eq!(completion.result, ResultCode::Ok);
    assert_eq!(callbacks.writes[0], callbacks.writes[1]);
    assert_eq!(callbacks.writes[1..].concat(), b"hello");
}
