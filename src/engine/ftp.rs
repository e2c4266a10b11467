use std::{
    collections::VecDeque,
    mem,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use percent_encoding::percent_decode_str;
use url::Url;

use super::{
    conn::{self, Connection, ReadOutcome},
    Action, Callbacks, EngineEvent, Failed, HandleId, PauseState, Progress, ResultCode, Socket,
    SocketAction, Step, TransferConfig,
};

const READ_CHUNK: usize = 16 * 1024;

/// An anonymous or password authenticated passive mode download.
///
/// The control connection runs `USER`, `PASS`, `TYPE I`, `SIZE`, `PASV`
/// and `RETR`; every reply line is handed to the header callback and the
/// data connection feeds the body callback.
pub(super) struct FtpTransfer {
    url: Url,
    control: Option<Connection>,
    data: Option<Connection>,
    stage: Stage,
    opened: bool,
    ctrl_in: Vec<u8>,
    ctrl_out: Vec<u8>,
    ctrl_pos: usize,
    multiline: Option<String>,
    size: Option<u64>,
    pause: PauseState,
    held: Option<Vec<u8>>,
    data_eof: bool,
    complete: bool,
    control_eof: bool,
    progress: Progress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Greeting,
    User,
    Pass,
    Type,
    Size,
    Pasv,
    DataConnect,
    Retr,
    Transfer,
}

// ===== impl FtpTransfer =====

impl FtpTransfer {
    pub(super) fn new(config: TransferConfig) -> FtpTransfer {
        FtpTransfer {
            url: config.url,
            control: None,
            data: None,
            stage: Stage::Greeting,
            opened: false,
            ctrl_in: Vec::new(),
            ctrl_out: Vec::new(),
            ctrl_pos: 0,
            multiline: None,
            size: None,
            pause: PauseState::default(),
            held: None,
            data_eof: false,
            complete: false,
            control_eof: false,
            progress: Progress::default(),
        }
    }

    pub(super) fn owns(&self, socket: Socket) -> bool {
        let owned = |conn: &Option<Connection>| conn.as_ref().and_then(Connection::socket) == Some(socket);
        owned(&self.control) || owned(&self.data)
    }

    pub(super) fn set_pause(&mut self, pause: PauseState) -> PauseState {
        mem::replace(&mut self.pause, pause)
    }

    pub(super) fn close(&mut self, events: &mut VecDeque<EngineEvent>) {
        if let Some(data) = &mut self.data {
            data.close(events);
        }
        if let Some(control) = &mut self.control {
            control.close(events);
        }
    }

    pub(super) fn drive(
        &mut self,
        id: HandleId,
        events: &mut VecDeque<EngineEvent>,
        cb: &mut dyn Callbacks,
    ) -> Step {
        match self.run(id, events, cb) {
            Ok(true) => Step::Done(ResultCode::Ok, None),
            Ok(false) => {
                self.update_interest(events);
                Step::Pending
            }
            Err((code, os_error)) => Step::Done(code, os_error),
        }
    }

    fn run(
        &mut self,
        id: HandleId,
        events: &mut VecDeque<EngineEvent>,
        cb: &mut dyn Callbacks,
    ) -> Result<bool, Failed> {
        if self.control.is_none() {
            log::trace!("RETR {}", self.url);
            self.control = Some(Connection::new(conn::resolve(&self.url)?));
        }
        let Some(control) = self.control.as_mut() else {
            return Ok(false);
        };
        if !control.poll_connect(events)? {
            return Ok(false);
        }
        if !self.opened {
            self.opened = true;
            if let Some(socket) = control.socket() {
                if cb.on_socket_open(id, socket) == Action::Abort {
                    return Err((ResultCode::AbortedByCallback, None));
                }
            }
        }

        self.flush_control()?;
        self.read_control(id, cb)?;
        self.poll_data(id, events, cb)?;
        self.flush_control()?;
        self.read_data(id, events, cb)?;

        if self.complete && self.data_eof && self.held.is_none() {
            self.command("QUIT");
            if let Err((_, os_error)) = self.flush_control() {
                log::trace!("QUIT not sent: {os_error:?}");
            }
            return Ok(true);
        }
        if self.control_eof && !self.complete {
            log::debug!("FTP control connection closed early");
            return Err((ResultCode::RecvError, None));
        }
        Ok(false)
    }

    fn command(&mut self, command: &str) {
        if command.starts_with("PASS ") {
            log::trace!("> PASS ****");
        } else {
            log::trace!("> {command}");
        }
        self.ctrl_out.extend_from_slice(command.as_bytes());
        self.ctrl_out.extend_from_slice(b"\r\n");
    }

    fn flush_control(&mut self) -> Result<(), Failed> {
        let Some(control) = self.control.as_mut() else {
            return Ok(());
        };
        if conn::write_some(control, &self.ctrl_out, &mut self.ctrl_pos)? {
            self.ctrl_out.clear();
            self.ctrl_pos = 0;
        }
        Ok(())
    }

    fn read_control(&mut self, id: HandleId, cb: &mut dyn Callbacks) -> Result<(), Failed> {
        let mut buf = vec![0; 4096];
        loop {
            if self.control_eof {
                return Ok(());
            }
            let Some(control) = self.control.as_mut() else {
                return Ok(());
            };
            match conn::read_some(control, &mut buf)? {
                ReadOutcome::Data(n) => self.ctrl_in.extend_from_slice(&buf[..n]),
                ReadOutcome::Eof => self.control_eof = true,
                ReadOutcome::WouldBlock => return Ok(()),
            }
            self.handle_lines(id, cb)?;
        }
    }

    fn handle_lines(&mut self, id: HandleId, cb: &mut dyn Callbacks) -> Result<(), Failed> {
        while let Some(pos) = self.ctrl_in.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = self.ctrl_in.drain(..pos + 2).collect();
            if cb.on_header(id, &line, self.size) == Action::Abort {
                return Err((ResultCode::AbortedByCallback, None));
            }

            let text = String::from_utf8_lossy(&line[..pos]).into_owned();
            log::trace!("< {text}");
            let code = text
                .get(..3)
                .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
                .map(str::to_owned);
            let separator = text.as_bytes().get(3).copied();

            match (self.multiline.take(), code) {
                (Some(open), Some(code)) if code == open && separator != Some(b'-') => {
                    self.on_reply(&code, &text)?;
                }
                (Some(open), _) => self.multiline = Some(open),
                (None, Some(code)) if separator == Some(b'-') => self.multiline = Some(code),
                (None, Some(code)) => self.on_reply(&code, &text)?,
                (None, None) => {
                    log::debug!("not an FTP reply: {text:?}");
                    return Err((ResultCode::WeirdServerReply, None));
                }
            }
        }
        Ok(())
    }

    fn on_reply(&mut self, code: &str, text: &str) -> Result<(), Failed> {
        let code: u16 = code.parse().map_err(|_| (ResultCode::WeirdServerReply, None))?;
        match (self.stage, code) {
            (Stage::Greeting, 220) => {
                let user = self.user();
                self.command(&format!("USER {user}"));
                self.stage = Stage::User;
            }
            (Stage::User, 331) => {
                let password = self.password();
                self.command(&format!("PASS {password}"));
                self.stage = Stage::Pass;
            }
            (Stage::User, 230) | (Stage::Pass, 230) | (Stage::Pass, 202) => {
                self.command("TYPE I");
                self.stage = Stage::Type;
            }
            (Stage::User, _) | (Stage::Pass, _) if code >= 400 => {
                log::debug!("FTP login denied: {text}");
                return Err((ResultCode::Other, None));
            }
            (Stage::Type, 200) => {
                let path = self.path();
                self.command(&format!("SIZE {path}"));
                self.stage = Stage::Size;
            }
            (Stage::Size, _) if code >= 200 => {
                if code == 213 {
                    self.size = text.get(4..).and_then(|s| s.trim().parse().ok());
                    self.progress.expected_received = self.size;
                }
                self.command("PASV");
                self.stage = Stage::Pasv;
            }
            (Stage::Pasv, 227) => {
                let announced = parse_pasv(text).ok_or((ResultCode::WeirdServerReply, None))?;
                let peer = self.control.as_ref().and_then(Connection::peer_addr);
                let addr = match peer {
                    Some(peer) => SocketAddr::new(peer.ip(), announced.port()),
                    None => announced,
                };
                log::trace!("data connection to {addr}");
                self.data = Some(Connection::new(vec![addr]));
                self.stage = Stage::DataConnect;
            }
            (Stage::Retr, 150) | (Stage::Retr, 125) => self.stage = Stage::Transfer,
            (Stage::Retr, 550) => return Err((ResultCode::RemoteFileNotFound, None)),
            (Stage::Transfer, 226) | (Stage::Transfer, 250) => self.complete = true,
            (_, code) if code >= 400 => {
                log::debug!("FTP command failed: {text}");
                return Err((ResultCode::Other, None));
            }
            _ => {}
        }
        Ok(())
    }

    fn poll_data(
        &mut self,
        id: HandleId,
        events: &mut VecDeque<EngineEvent>,
        cb: &mut dyn Callbacks,
    ) -> Result<(), Failed> {
        let Some(data) = self.data.as_mut() else {
            return Ok(());
        };
        if !data.poll_connect(events)? || self.stage != Stage::DataConnect {
            return Ok(());
        }
        if let Some(socket) = data.socket() {
            if cb.on_socket_open(id, socket) == Action::Abort {
                return Err((ResultCode::AbortedByCallback, None));
            }
        }
        let path = self.path();
        self.command(&format!("RETR {path}"));
        self.stage = Stage::Retr;
        Ok(())
    }

    fn read_data(
        &mut self,
        id: HandleId,
        events: &mut VecDeque<EngineEvent>,
        cb: &mut dyn Callbacks,
    ) -> Result<(), Failed> {
        if self.stage != Stage::Transfer {
            return Ok(());
        }
        let mut buf = vec![0; READ_CHUNK];
        loop {
            if self.pause.receive {
                return Ok(());
            }
            if let Some(held) = self.held.take() {
                if !self.deliver(id, held, cb)? {
                    return Ok(());
                }
            }
            if self.data_eof {
                return Ok(());
            }
            let Some(data) = self.data.as_mut() else {
                return Ok(());
            };
            match conn::read_some(data, &mut buf)? {
                ReadOutcome::Data(n) => {
                    self.progress.received += n as u64;
                    cb.on_progress(id, self.progress);
                    if !self.deliver(id, buf[..n].to_vec(), cb)? {
                        return Ok(());
                    }
                }
                ReadOutcome::Eof => {
                    data.close(events);
                    self.data = None;
                    self.data_eof = true;
                }
                ReadOutcome::WouldBlock => return Ok(()),
            }
        }
    }

    fn deliver(&mut self, id: HandleId, data: Vec<u8>, cb: &mut dyn Callbacks) -> Result<bool, Failed> {
        match cb.on_write(id, &data) {
            Action::Proceed => Ok(true),
            Action::Pause => {
                self.held = Some(data);
                self.pause.receive = true;
                Ok(false)
            }
            Action::Abort => Err((ResultCode::AbortedByCallback, None)),
        }
    }

    fn update_interest(&mut self, events: &mut VecDeque<EngineEvent>) {
        let write = self.ctrl_pos < self.ctrl_out.len();
        if let Some(control) = &mut self.control {
            if control.is_connected() {
                let action = match (self.control_eof, write) {
                    (false, true) => SocketAction::ReadWrite,
                    (false, false) => SocketAction::Read,
                    (true, true) => SocketAction::Write,
                    (true, false) => SocketAction::None,
                };
                control.set_interest(action, events);
            }
        }
        if let Some(data) = &mut self.data {
            if data.is_connected() {
                let action = if self.pause.receive {
                    SocketAction::None
                } else {
                    SocketAction::Read
                };
                data.set_interest(action, events);
            }
        }
    }

    fn user(&self) -> String {
        match self.url.username() {
            "" => "anonymous".to_owned(),
            user => percent_decode_str(user).decode_utf8_lossy().into_owned(),
        }
    }

    fn password(&self) -> String {
        match self.url.password() {
            Some(password) => percent_decode_str(password).decode_utf8_lossy().into_owned(),
            None => "ftp@example.com".to_owned(),
        }
    }

    fn path(&self) -> String {
        let path = self.url.path().trim_start_matches('/');
        percent_decode_str(path).decode_utf8_lossy().into_owned()
    }
}

/// Reads the address of a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
/// reply.
fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let rest = text.get(3..)?;
    let start = rest.find(|c: char| c.is_ascii_digit())?;
    let numbers = rest[start..]
        .split(',')
        .take(6)
        .map(|part| {
            part.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u8>()
                .ok()
        })
        .collect::<Option<Vec<u8>>>()?;
    let [a, b, c, d, hi, lo] = <[u8; 6]>::try_from(numbers).ok()?;
    let ip = IpAddr::V4(Ipv4Addr::new(a, b, c, d));
    Some(SocketAddr::new(ip, u16::from(hi) << 8 | u16::from(lo)))
}
