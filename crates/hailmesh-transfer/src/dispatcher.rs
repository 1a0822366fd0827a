//! Serialized datagram dispatch.
//!
//! Every registered endpoint gets a reader task. Readers never touch
//! application state; they push datagrams into a single queue drained by one
//! worker task, which owns the [`DatagramHandler`] outright. Handler calls are
//! therefore strictly one at a time no matter how many sockets are
//! registered, and the handler needs no locking of its own.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::transport::{Endpoint, MAX_DATAGRAM};

/// Depth of the shared inbound queue.
pub const QUEUE_DEPTH: usize = 1024;

/// Identifies a registered endpoint.
pub type SocketId = u64;

/// One received datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Endpoint the datagram arrived on
    pub socket: SocketId,
    /// Sender address
    pub from: SocketAddr,
    /// Raw payload
    pub payload: Bytes,
}

/// A datagram the handler wants sent from the receiving endpoint.
#[derive(Debug, Clone)]
pub struct Reply {
    pub to: SocketAddr,
    pub payload: Bytes,
}

impl Reply {
    pub fn new(to: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            to,
            payload: payload.into(),
        }
    }
}

/// Application callback driven by the [`Dispatcher`].
pub trait DatagramHandler: Send + 'static {
    /// Handle one datagram and return what to send in response.
    fn handle(&mut self, datagram: Datagram) -> Vec<Reply>;
}

impl<F> DatagramHandler for F
where
    F: FnMut(Datagram) -> Vec<Reply> + Send + 'static,
{
    fn handle(&mut self, datagram: Datagram) -> Vec<Reply> {
        self(datagram)
    }
}

/// Work queued by the owner of the dispatcher, run against the handler
/// between datagrams.
type LocalCall<H> = Box<dyn FnOnce(&mut H) -> Vec<Reply> + Send>;

enum Event<H> {
    Register(SocketId, Endpoint),
    Deregister(SocketId),
    Datagram(Datagram),
    Local(SocketId, LocalCall<H>),
    Shutdown,
}

/// Multiplexes any number of endpoints onto one handler.
///
/// Dropping a dispatcher without calling [`shutdown`](Self::shutdown) aborts
/// its readers and worker, so the endpoints stop answering.
pub struct Dispatcher<H: DatagramHandler> {
    tx: mpsc::Sender<Event<H>>,
    readers: HashMap<SocketId, JoinHandle<()>>,
    worker: Option<JoinHandle<H>>,
    next_id: SocketId,
}

impl<H: DatagramHandler> Dispatcher<H> {
    /// Start the worker task. Must be called from within a tokio runtime.
    pub fn new(handler: H) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let worker = tokio::spawn(run_worker(handler, rx));
        Self {
            tx,
            readers: HashMap::new(),
            worker: Some(worker),
            next_id: 0,
        }
    }

    /// Start delivering datagrams received on `endpoint`.
    pub async fn register(&mut self, endpoint: Endpoint) -> anyhow::Result<SocketId> {
        let id = self.next_id;
        self.next_id += 1;

        // Queued ahead of anything the reader produces, so the worker always
        // knows the endpoint before its first datagram.
        self.tx
            .send(Event::Register(id, endpoint.clone()))
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher worker has stopped"))?;

        let reader = tokio::spawn(run_reader(id, endpoint, self.tx.clone()));
        self.readers.insert(id, reader);
        tracing::debug!(socket = id, "endpoint registered");
        Ok(id)
    }

    /// Stop delivering datagrams from `id`. Returns false if it was not registered.
    pub async fn deregister(&mut self, id: SocketId) -> bool {
        let Some(reader) = self.readers.remove(&id) else {
            return false;
        };
        reader.abort();
        let _ = self.tx.send(Event::Deregister(id)).await;
        tracing::debug!(socket = id, "endpoint deregistered");
        true
    }

    /// Run `f` on the handler in turn with inbound datagrams and send the
    /// replies it returns from endpoint `socket`.
    pub async fn call<R, F>(&self, socket: SocketId, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut H) -> (R, Vec<Reply>) + Send + 'static,
        R: Send + 'static,
    {
        let (done, result) = oneshot::channel();
        let call: LocalCall<H> = Box::new(move |handler| {
            let (value, replies) = f(handler);
            let _ = done.send(value);
            replies
        });
        self.tx
            .send(Event::Local(socket, call))
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher worker has stopped"))?;
        result
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher worker dropped the call"))
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Stop every reader, let the worker drain what is already queued and
    /// hand the handler back.
    pub async fn shutdown(mut self) -> anyhow::Result<H> {
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow::anyhow!("dispatcher worker already taken"))?;
        self.tx
            .send(Event::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher worker has stopped"))?;
        let handler = worker.await?;
        Ok(handler)
    }
}

impl<H: DatagramHandler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
            tracing::debug!("dispatcher dropped without shutdown");
        }
    }
}

async fn run_reader<H>(id: SocketId, endpoint: Endpoint, tx: mpsc::Sender<Event<H>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match endpoint.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::error!(socket = id, "receive failed, reader stopping: {}", e);
                break;
            }
        };
        tracing::trace!(socket = id, from = %from, len, "datagram received");

        let datagram = Datagram {
            socket: id,
            from,
            payload: Bytes::copy_from_slice(&buf[..len]),
        };
        if tx.send(Event::Datagram(datagram)).await.is_err() {
            break;
        }
    }
}

async fn run_worker<H: DatagramHandler>(mut handler: H, mut rx: mpsc::Receiver<Event<H>>) -> H {
    let mut endpoints: HashMap<SocketId, Endpoint> = HashMap::new();

    while let Some(event) = rx.recv().await {
        let (socket, replies) = match event {
            Event::Register(id, endpoint) => {
                endpoints.insert(id, endpoint);
                continue;
            }
            Event::Deregister(id) => {
                endpoints.remove(&id);
                continue;
            }
            Event::Datagram(datagram) => {
                let socket = datagram.socket;
                // Late datagrams from a reader aborted mid-send.
                if !endpoints.contains_key(&socket) {
                    continue;
                }
                (socket, handler.handle(datagram))
            }
            Event::Local(socket, call) => (socket, call(&mut handler)),
            Event::Shutdown => break,
        };

        let Some(endpoint) = endpoints.get(&socket) else {
            if !replies.is_empty() {
                tracing::warn!(socket, dropped = replies.len(), "no endpoint to send from");
            }
            continue;
        };
        for reply in replies {
            if let Err(e) = endpoint.send_to(reply.to, &reply.payload).await {
                tracing::warn!(socket, to = %reply.to, "send failed: {}", e);
            }
        }
    }

    handler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use std::time::Duration;

    async fn loopback() -> Endpoint {
        Endpoint::bind(TransportConfig::loopback()).await.unwrap()
    }

    #[tokio::test]
    async fn echo_reply_uses_receiving_socket() {
        let server = loopback().await;
        let server_addr = server.local_addr().unwrap();
        let mut dispatcher = Dispatcher::new(|d: Datagram| vec![Reply::new(d.from, d.payload)]);
        dispatcher.register(server).await.unwrap();

        let client = loopback().await;
        client.send_to(server_addr, b"ping").await.unwrap();

        let mut buf = vec![0u8; 64];
        let (len, from) = client
            .recv_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("echo");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, server_addr);

        dispatcher.shutdown().await.unwrap();
    }

    struct Counter {
        seen: Vec<(SocketId, Bytes)>,
    }

    impl DatagramHandler for Counter {
        fn handle(&mut self, datagram: Datagram) -> Vec<Reply> {
            self.seen.push((datagram.socket, datagram.payload.clone()));
            vec![Reply::new(datagram.from, datagram.payload)]
        }
    }

    #[tokio::test]
    async fn many_sockets_one_handler() {
        let a = loopback().await;
        let b = loopback().await;
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        let mut dispatcher = Dispatcher::new(Counter { seen: Vec::new() });
        let id_a = dispatcher.register(a).await.unwrap();
        let id_b = dispatcher.register(b).await.unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(dispatcher.len(), 2);

        let client = loopback().await;
        let mut buf = vec![0u8; 64];
        for (addr, payload) in [(a_addr, b"to-a"), (b_addr, b"to-b")] {
            client.send_to(addr, payload).await.unwrap();
            // Wait for the echo so the handler has seen it before shutdown.
            client
                .recv_timeout(&mut buf, Duration::from_secs(2))
                .await
                .unwrap()
                .expect("echo");
        }

        let counter = dispatcher.shutdown().await.unwrap();
        assert_eq!(counter.seen.len(), 2);
        assert_eq!(counter.seen[0], (id_a, Bytes::from_static(b"to-a")));
        assert_eq!(counter.seen[1], (id_b, Bytes::from_static(b"to-b")));
    }

    #[tokio::test]
    async fn deregister_stops_delivery() {
        let server = loopback().await;
        let server_addr = server.local_addr().unwrap();
        let mut dispatcher = Dispatcher::new(Counter { seen: Vec::new() });
        let id = dispatcher.register(server).await.unwrap();

        assert!(dispatcher.deregister(id).await);
        assert!(!dispatcher.deregister(id).await);
        assert!(dispatcher.is_empty());

        let client = loopback().await;
        client.send_to(server_addr, b"late").await.unwrap();
        let mut buf = vec![0u8; 64];
        let got = client
            .recv_timeout(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(got.is_none());

        let counter = dispatcher.shutdown().await.unwrap();
        assert!(counter.seen.is_empty());
    }

    #[tokio::test]
    async fn dropping_stops_answering() {
        let server = loopback().await;
        let server_addr = server.local_addr().unwrap();
        let mut dispatcher = Dispatcher::new(|d: Datagram| vec![Reply::new(d.from, d.payload)]);
        dispatcher.register(server).await.unwrap();

        let client = loopback().await;
        let mut buf = vec![0u8; 64];
        client.send_to(server_addr, b"before").await.unwrap();
        assert!(client
            .recv_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .is_some());

        drop(dispatcher);
        tokio::task::yield_now().await;

        client.send_to(server_addr, b"after-drop").await.unwrap();
        let got = client
            .recv_timeout(&mut buf, Duration::from_millis(150))
            .await
            .unwrap();
        assert!(got.is_none(), "dropped dispatcher still echoed");
    }

    #[tokio::test]
    async fn local_call_runs_in_turn_and_sends_from_socket() {
        let server = loopback().await;
        let server_addr = server.local_addr().unwrap();
        let mut dispatcher = Dispatcher::new(Counter { seen: Vec::new() });
        let id = dispatcher.register(server).await.unwrap();

        let client = loopback().await;
        let client_addr = client.local_addr().unwrap();
        client.send_to(server_addr, b"first").await.unwrap();
        let mut buf = vec![0u8; 64];
        client
            .recv_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("echo");

        let seen = dispatcher
            .call(id, move |counter: &mut Counter| {
                let seen = counter.seen.len();
                (seen, vec![Reply::new(client_addr, &b"pushed"[..])])
            })
            .await
            .unwrap();
        assert_eq!(seen, 1);

        let (len, from) = client
            .recv_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("pushed datagram");
        assert_eq!(&buf[..len], b"pushed");
        assert_eq!(from, server_addr);

        dispatcher.shutdown().await.unwrap();
    }
}
