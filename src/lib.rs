#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # rquest-transfer
//!
//! The `rquest-transfer` crate runs HTTP/1.1 and FTP transfers on a
//! readiness-driven engine and hands them to callers as tasks.
//!
//! - A [`Session`] owns one work queue thread that multiplexes every
//!   transfer of its tasks over non-blocking sockets
//! - [`Task`]s start suspended and can be resumed, suspended and cancelled
//! - Redirects are followed by the session, up to 20 by default, and can be
//!   confirmed by a [`TaskDelegate`]
//! - Idle timeouts restart whenever data moves
//! - Injected [cookie](cookie::CookieStore), [credential](credential::CredentialStore)
//!   and [cache](cache::UrlCache) stores
//! - Transparent `gzip` and `deflate` decoding
//!
//! ## Making a GET request
//!
//! ```rust
//! # async fn run() -> Result<(), rquest_transfer::Error> {
//! let session = rquest_transfer::Session::new();
//! let completed = session.get("http://example.com/").send().await?;
//!
//! println!("status = {:?}", completed.status());
//! println!("body = {}", completed.text());
//! # Ok(())
//! # }
//! ```
//!
//! ## Tasks and delegates
//!
//! `send()` is a shortcut for creating a data task, resuming it and waiting
//! for it. Tasks can also be driven by hand, with a delegate receiving the
//! response and the body as they arrive:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rquest_transfer::{bytes::Bytes, Session, Task, TaskDelegate};
//!
//! #[derive(Debug)]
//! struct Printer;
//!
//! impl TaskDelegate for Printer {
//!     fn did_receive_data(&self, task: &Task, data: Bytes) {
//!         println!("task {} got {} bytes", task.task_identifier(), data.len());
//!     }
//! }
//!
//! # fn run() -> Result<(), rquest_transfer::Error> {
//! let session = Session::new();
//! let request = session.get("http://example.com/").build()?;
//! let task = session.data_task_with_delegate(request, Arc::new(Printer));
//! task.resume();
//! # Ok(())
//! # }
//! ```
//!
//! ## Redirect Policies
//!
//! By default, a `Session` follows up to 20 redirects and fails the task
//! with [`ErrorCode::TooManyRedirects`] after that. Use a
//! [`redirect::Policy`] with [`SessionBuilder::redirect`] to change it.
//!
//! ## Cookies
//!
//! Cookies are only kept when the session is given a store, either the
//! built-in [`Jar`](cookie::Jar) through [`SessionBuilder::cookie_store`] or
//! any [`CookieStore`](cookie::CookieStore) implementation.
//!
//! ## Optional Features
//!
//! - **cookies** *(enabled by default)*: Provides the cookie jar.
//! - **gzip** *(enabled by default)*: Decodes `gzip` response bodies.
//! - **deflate** *(enabled by default)*: Decodes `deflate` response bodies.

pub use bytes;
pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use url::Url;

mod error;
mod into_url;

pub use self::body::Body;
pub use self::error::{Error, ErrorCode, Result};
pub use self::into_url::IntoUrl;
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;
pub use self::session::{Session, SessionBuilder};
pub use self::state::ParseError;
pub use self::task::{
    ChallengeDisposition, Completed, RedirectDecision, ResponseDisposition, Task, TaskDelegate,
    TaskState,
};

mod body;
pub mod cache;
pub mod cookie;
pub mod credential;
mod easy;
pub mod engine;
pub mod message;
mod multi;
mod protocol;
mod queue;
pub mod redirect;
mod request;
mod response;
mod session;
mod state;
mod sync;
mod task;
mod util;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Session>();
    assert_sync::<Session>();
    assert_clone::<Session>();

    assert_send::<Task>();
    assert_sync::<Task>();
    assert_clone::<Task>();

    assert_send::<Request>();
    assert_send::<RequestBuilder>();
    assert_send::<Response>();
    assert_send::<Completed>();
    assert_send::<RedirectDecision>();

    assert_send::<Error>();
    assert_sync::<Error>();
}
