use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use tokio::sync::mpsc;

use rquest_transfer::{
    bytes::Bytes, credential::AuthenticationChallenge, ChallengeDisposition, Error, ErrorCode,
    RedirectDecision, Request, Response, ResponseDisposition, Task, TaskDelegate,
};

/// What a [`Recorder`] saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Redirect(String),
    Response(u16),
    Data(usize),
    Sent(u64),
    Challenge(usize),
    Downloaded(PathBuf),
    Complete(Option<ErrorCode>),
}

/// A delegate recording every call and signalling completion.
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
    body: Mutex<Vec<u8>>,
    done_tx: mpsc::UnboundedSender<Option<ErrorCode>>,
    done_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<ErrorCode>>>,
    follow_redirects: bool,
    hold_redirects: bool,
    held: Mutex<Vec<RedirectDecision>>,
    cancel_response: bool,
    challenge: Option<ChallengeDisposition>,
}

impl Default for Recorder {
    fn default() -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Recorder {
            seen: Mutex::new(Vec::new()),
            body: Mutex::new(Vec::new()),
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
            follow_redirects: true,
            hold_redirects: false,
            held: Mutex::new(Vec::new()),
            cancel_response: false,
            challenge: None,
        }
    }
}

#[allow(unused)]
impl Recorder {
    pub fn decline_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Keeps redirect decisions without answering them.
    pub fn hold_redirects(mut self) -> Self {
        self.hold_redirects = true;
        self
    }

    pub fn cancel_on_response(mut self) -> Self {
        self.cancel_response = true;
        self
    }

    pub fn answer_challenge(mut self, disposition: ChallengeDisposition) -> Self {
        self.challenge = Some(disposition);
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.lock().unwrap().clone()
    }

    /// Waits for the task to complete, returning its error code.
    pub async fn completed(&self) -> Option<ErrorCode> {
        let mut rx = self.done_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("task should complete")
            .expect("delegate alive")
    }

    /// Whether the task completed, without waiting.
    pub fn is_completed(&self) -> bool {
        self.seen().iter().any(|seen| matches!(seen, Seen::Complete(_)))
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }
}

impl TaskDelegate for Recorder {
    fn will_perform_redirection(
        &self,
        _task: &Task,
        _response: &Response,
        new_request: Request,
        decision: RedirectDecision,
    ) {
        self.push(Seen::Redirect(new_request.url().path().to_owned()));
        if self.hold_redirects {
            self.held.lock().unwrap().push(decision);
        } else if self.follow_redirects {
            decision.follow(new_request);
        } else {
            decision.decline();
        }
    }

    fn did_receive_response(&self, _task: &Task, response: &Response) -> ResponseDisposition {
        self.push(Seen::Response(response.status().map_or(0, |s| s.as_u16())));
        if self.cancel_response {
            ResponseDisposition::Cancel
        } else {
            ResponseDisposition::Allow
        }
    }

    fn did_receive_data(&self, _task: &Task, data: Bytes) {
        self.body.lock().unwrap().extend_from_slice(&data);
        self.push(Seen::Data(data.len()));
    }

    fn did_send_body_data(&self, _task: &Task, _sent: u64, total: u64, _expected: Option<u64>) {
        self.push(Seen::Sent(total));
    }

    fn did_receive_challenge(
        &self,
        _task: &Task,
        challenge: &AuthenticationChallenge,
    ) -> ChallengeDisposition {
        self.push(Seen::Challenge(challenge.previous_failure_count()));
        self.challenge
            .clone()
            .unwrap_or(ChallengeDisposition::PerformDefaultHandling)
    }

    fn did_finish_downloading(&self, _task: &Task, location: &Path) {
        self.push(Seen::Downloaded(location.to_owned()));
    }

    fn did_complete(&self, _task: &Task, error: Option<&Error>) {
        let code = error.map(Error::code);
        self.push(Seen::Complete(code));
        let _ = self.done_tx.send(code);
    }
}
