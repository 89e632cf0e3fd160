/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Push notification channel.
//!
//! A topic-subscribed listener over a pluggable message-queue transport.
//! The listener thread does a blocking receive with a short timeout and
//! checks a shutdown flag between receives; `quit()` closes the
//! connection and joins the thread. The crate ships an in-process broker
//! implementation of the transport for tests and headless embedding;
//! real deployments plug in a transport speaking to the message queue
//! endpoint announced in the downloaded settings.

use crate::error::{ClientError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long one blocking receive waits before re-checking the shutdown
/// flag.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub topic: String,
    pub body: String,
}

pub trait MessageConnection: Send {
    fn subscribe(&mut self, topic: &str) -> Result<()>;
    fn unsubscribe(&mut self, topic: &str) -> Result<()>;
    /// Blocking receive; `Ok(None)` on timeout, `Err` when the
    /// connection is gone.
    fn receive(&mut self, timeout: Duration) -> Result<Option<PushMessage>>;
    fn close(&mut self);
}

pub trait MessageTransport: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn MessageConnection>>;
}

/// Topic carrying account-level update notifications.
pub fn user_topic(user_id: &str) -> String {
    format!("user-{}", user_id)
}

/// Topic carrying update notifications for one subscription, keyed by
/// the percent-encoded short unsecret URL.
pub fn subscription_topic(short_unsecret_url: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(short_unsecret_url.as_bytes()).collect();
    format!("subscription-{}", encoded)
}

// -- In-process broker ------------------------------------------------------

struct BrokerClient {
    topics: HashSet<String>,
    sender: Sender<PushMessage>,
}

#[derive(Default)]
struct BrokerInner {
    clients: Mutex<HashMap<u64, BrokerClient>>,
    next_id: AtomicU64,
}

/// An in-process message queue. Every connection sees the messages for
/// the topics it subscribed to.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: &str, body: &str) {
        let clients = self.inner.clients.lock();
        for client in clients.values() {
            if client.topics.contains(topic) {
                let _ = client.sender.send(PushMessage {
                    topic: topic.to_string(),
                    body: body.to_string(),
                });
            }
        }
    }

    pub fn transport(&self) -> Box<dyn MessageTransport> {
        Box::new(BrokerTransport {
            inner: self.inner.clone(),
        })
    }
}

struct BrokerTransport {
    inner: Arc<BrokerInner>,
}

impl MessageTransport for BrokerTransport {
    fn connect(&self, _endpoint: &str) -> Result<Box<dyn MessageConnection>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.clients.lock().insert(
            id,
            BrokerClient {
                topics: HashSet::new(),
                sender,
            },
        );
        Ok(Box::new(BrokerConnection {
            id,
            inner: self.inner.clone(),
            receiver,
        }))
    }
}

struct BrokerConnection {
    id: u64,
    inner: Arc<BrokerInner>,
    receiver: Receiver<PushMessage>,
}

impl MessageConnection for BrokerConnection {
    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut clients = self.inner.clients.lock();
        let client = clients
            .get_mut(&self.id)
            .ok_or_else(|| ClientError::message("connection is closed"))?;
        client.topics.insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let mut clients = self.inner.clients.lock();
        let client = clients
            .get_mut(&self.id)
            .ok_or_else(|| ClientError::message("connection is closed"))?;
        client.topics.remove(topic);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<PushMessage>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ClientError::message("connection is closed"))
            }
        }
    }

    fn close(&mut self) {
        self.inner.clients.lock().remove(&self.id);
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// -- Listener ---------------------------------------------------------------

type Handler = Arc<dyn Fn(PushMessage) + Send + Sync>;

struct ChannelState {
    connection: Option<Arc<Mutex<Box<dyn MessageConnection>>>>,
    listener: Option<JoinHandle<()>>,
    listener_thread: Option<std::thread::ThreadId>,
    topics: HashSet<String>,
}

/// Listener lifecycle and topic registry. Dispatching received messages
/// is delegated to the handler supplied at connect time.
pub(crate) struct PushChannel {
    transport: Box<dyn MessageTransport>,
    state: Mutex<ChannelState>,
    running: Arc<AtomicBool>,
}

impl PushChannel {
    pub fn new(transport: Box<dyn MessageTransport>) -> Self {
        PushChannel {
            transport,
            state: Mutex::new(ChannelState {
                connection: None,
                listener: None,
                listener_thread: None,
                topics: HashSet::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Remember a topic and subscribe the live connection, if any.
    pub fn register_topic(&self, topic: &str) {
        let mut state = self.state.lock();
        state.topics.insert(topic.to_string());
        if let Some(connection) = &state.connection {
            if let Err(e) = connection.lock().subscribe(topic) {
                log::warn!("could not subscribe to {}: {}", topic, e);
            }
        }
    }

    pub fn unregister_topic(&self, topic: &str) {
        let mut state = self.state.lock();
        state.topics.remove(topic);
        if let Some(connection) = &state.connection {
            if let Err(e) = connection.lock().unsubscribe(topic) {
                log::warn!("could not unsubscribe from {}: {}", topic, e);
            }
        }
    }

    /// Connect and start the listener. No-op when already connected.
    pub fn connect(&self, endpoint: &str, handler: Handler) -> Result<()> {
        let mut state = self.state.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut connection = self.transport.connect(endpoint)?;
        for topic in &state.topics {
            connection.subscribe(topic)?;
        }
        let connection = Arc::new(Mutex::new(connection));

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let listener_connection = connection.clone();
        let listener = std::thread::Builder::new()
            .name("typeworld-push-listener".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let received = listener_connection.lock().receive(RECEIVE_TIMEOUT);
                    match received {
                        Ok(Some(message)) => handler(message),
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("push connection lost: {}", e);
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                }
            })?;

        state.listener_thread = Some(listener.thread().id());
        state.listener = Some(listener);
        state.connection = Some(connection);
        Ok(())
    }

    /// Stop the listener and close the connection. Returns whether a
    /// connection was actually open.
    pub fn quit(&self) -> bool {
        let (connection, listener, listener_thread) = {
            let mut state = self.state.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                return false;
            }
            (
                state.connection.take(),
                state.listener.take(),
                state.listener_thread.take(),
            )
        };
        if let Some(connection) = connection {
            connection.lock().close();
        }
        if let Some(listener) = listener {
            // A handler running on the listener thread may itself tear
            // down the channel; joining would deadlock there.
            if listener_thread != Some(std::thread::current().id()) {
                let _ = listener.join();
            }
        }
        true
    }
}
