//! Multiplexed raw-socket ICMP engine.
//!
//! One engine instance serves every concurrent ping caller in the
//! process. Echo requests are correlated to replies by (peer, id, seq):
//! reader threads pull packets off the raw sockets and hand them to a
//! dispatcher task, which matches them against the in-flight table and
//! releases the per-call latch.

mod packet;

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use socket2::{Domain, Protocol as SocketProtocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error};

use packet::{Family, build_echo_request, parse_echo_reply};

/// Readers poll the shutdown flag at this granularity.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const COMPLETION_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    V4Only,
    V6Only,
    Both,
}

#[derive(Debug, Error)]
pub enum PingError {
    #[error("pinger service is shut down")]
    Shutdown,
    #[error("this pinger instance does not support {0}")]
    UnsupportedFamily(&'static str),
    #[error("failed to send echo request: {0}")]
    Send(#[from] io::Error),
}

#[derive(Debug, Default)]
pub struct PingStats {
    pub sent: usize,
    pub received: usize,
    pub latency: Vec<Duration>,
}

type FlightKey = (String, u16, u16);

#[derive(Debug)]
struct EchoRequest {
    sent: SystemTime,
    received: Option<SystemTime>,
}

struct Flight {
    request: Arc<Mutex<EchoRequest>>,
    latch: Arc<CallLatch>,
}

/// Counts a call's outstanding echoes down to zero.
struct CallLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CallLatch {
    fn new(count: usize) -> Self {
        Self { remaining: AtomicUsize::new(count), notify: Notify::new() }
    }

    fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct Completion {
    peer: IpAddr,
    id: u16,
    seq: u16,
    received: SystemTime,
}

pub struct Pinger {
    counter: AtomicU16,
    in_flight: Mutex<HashMap<FlightKey, Flight>>,
    v4: Option<Socket>,
    v6: Option<Socket>,
    shutdown: Arc<AtomicBool>,
    readers: Mutex<Vec<thread::JoinHandle<()>>>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Pinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinger").finish_non_exhaustive()
    }
}

impl Pinger {
    /// Open one raw socket per enabled address family. Raw ICMP sockets
    /// need CAP_NET_RAW, so this is where a misconfigured deployment
    /// fails fast.
    pub fn new(protocol: IpProtocol) -> io::Result<Self> {
        let v4 = if protocol != IpProtocol::V6Only {
            Some(open_raw_socket(Domain::IPV4)?)
        } else {
            None
        };
        let v6 = if protocol != IpProtocol::V4Only {
            Some(open_raw_socket(Domain::IPV6)?)
        } else {
            None
        };
        Ok(Self {
            counter: AtomicU16::new(rand::random()),
            in_flight: Mutex::new(HashMap::new()),
            v4,
            v6,
            shutdown: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        })
    }

    /// Launch the reader threads and the completion dispatcher.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let (tx, rx) = mpsc::channel(COMPLETION_BUFFER);
        let mut readers = self.readers.lock().expect("pinger readers lock poisoned");

        for (socket, family) in [(&self.v4, Family::V4), (&self.v6, Family::V6)] {
            let Some(socket) = socket else { continue };
            let reader_socket = socket.try_clone()?;
            let tx = tx.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let handle = thread::Builder::new()
                .name(format!("icmp-{family}"))
                .spawn(move || read_loop(reader_socket, family, tx, shutdown))?;
            readers.push(handle);
        }
        drop(tx);

        let pinger = Arc::clone(self);
        *self.dispatcher.lock().expect("pinger dispatcher lock poisoned") =
            Some(tokio::spawn(dispatch(pinger, rx)));
        Ok(())
    }

    /// Send `count` echo requests to `address` and wait for the replies
    /// or the timeout. Safe to call concurrently; calls to the same
    /// address are disambiguated by the id counter.
    pub async fn ping(
        &self,
        address: IpAddr,
        count: usize,
        timeout: Duration,
    ) -> Result<PingStats, PingError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PingError::Shutdown);
        }
        let (socket, family) = match address {
            IpAddr::V4(_) => (self.v4.as_ref().ok_or(PingError::UnsupportedFamily("ipv4"))?, Family::V4),
            IpAddr::V6(_) => (self.v6.as_ref().ok_or(PingError::UnsupportedFamily("ipv6"))?, Family::V6),
        };

        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let latch = Arc::new(CallLatch::new(count));
        let peer = address.to_string();
        let dest: SockAddr = SocketAddr::new(address, 0).into();

        let mut requests = Vec::with_capacity(count);
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            for seq in 0..count as u16 {
                let request =
                    Arc::new(Mutex::new(EchoRequest { sent: SystemTime::now(), received: None }));
                in_flight.insert(
                    (peer.clone(), id, seq),
                    Flight { request: Arc::clone(&request), latch: Arc::clone(&latch) },
                );
                requests.push(request);
            }
        }

        for (seq, request) in requests.iter().enumerate() {
            let echo = build_echo_request(family, id, seq as u16);
            request.lock().expect("echo request lock poisoned").sent = SystemTime::now();
            if let Err(err) = socket.send_to(&echo, &dest) {
                self.remove_in_flight(&peer, id, count);
                return Err(PingError::Send(err));
            }
        }

        if tokio::time::timeout(timeout, latch.wait()).await.is_err() {
            debug!(peer = %peer, id, "ping timed out with requests outstanding");
            self.remove_in_flight(&peer, id, count);
        }

        let mut stats = PingStats { sent: count, ..Default::default() };
        for request in &requests {
            let request = request.lock().expect("echo request lock poisoned");
            if let Some(received) = request.received {
                stats.received += 1;
                stats.latency.push(received.duration_since(request.sent).unwrap_or_default());
            }
        }
        Ok(stats)
    }

    /// Stop the engine: readers notice the flag within the socket read
    /// timeout and exit, the dispatcher drains and exits when the last
    /// reader drops its sender. Blocks until both are down.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);

        let readers = std::mem::take(&mut *self.readers.lock().expect("pinger readers lock poisoned"));
        if !readers.is_empty() {
            let _ = tokio::task::spawn_blocking(move || {
                for reader in readers {
                    let _ = reader.join();
                }
            })
            .await;
        }

        let dispatcher = self.dispatcher.lock().expect("pinger dispatcher lock poisoned").take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
    }

    /// An engine with no sockets: every ping reports an unsupported
    /// family. Lets scheduler tests run without raw-socket privileges.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        Self {
            counter: AtomicU16::new(0),
            in_flight: Mutex::new(HashMap::new()),
            v4: None,
            v6: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        }
    }

    fn remove_in_flight(&self, peer: &str, id: u16, count: usize) {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        for seq in 0..count as u16 {
            in_flight.remove(&(peer.to_string(), id, seq));
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }
}

fn open_raw_socket(domain: Domain) -> io::Result<Socket> {
    let protocol =
        if domain == Domain::IPV4 { SocketProtocol::ICMPV4 } else { SocketProtocol::ICMPV6 };
    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    Ok(socket)
}

fn read_loop(
    socket: Socket,
    family: Family,
    tx: mpsc::Sender<Completion>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                let received = recv_timestamp(&socket).unwrap_or_else(SystemTime::now);
                // SAFETY: recv_from initialized the first `len` bytes
                let data =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };
                let Some(peer) = addr.as_socket().map(|sa| sa.ip()) else { continue };
                let Some(reply) = parse_echo_reply(family, data) else { continue };
                if tx
                    .blocking_send(Completion { peer, id: reply.id, seq: reply.seq, received })
                    .is_err()
                {
                    break;
                }
            }
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(err) => {
                if !shutdown.load(Ordering::Acquire) {
                    error!("failed to read from {family} socket: {err}");
                }
                break;
            }
        }
    }
    debug!("{family} listen loop ended");
}

/// Receive timestamp via SIOCGSTAMP where the kernel provides one,
/// otherwise the current wall clock.
#[cfg(target_os = "linux")]
fn recv_timestamp(socket: &Socket) -> Option<SystemTime> {
    use std::os::fd::AsRawFd;

    // Not exported by this version of the libc crate; value from linux/sockios.h.
    const SIOCGSTAMP: libc::c_ulong = 0x8906;

    let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCGSTAMP, &mut tv) };
    if rc != 0 || tv.tv_sec < 0 {
        return None;
    }
    Some(SystemTime::UNIX_EPOCH + Duration::new(tv.tv_sec as u64, tv.tv_usec as u32 * 1000))
}

#[cfg(not(target_os = "linux"))]
fn recv_timestamp(_socket: &Socket) -> Option<SystemTime> {
    None
}

async fn dispatch(pinger: Arc<Pinger>, mut rx: mpsc::Receiver<Completion>) {
    while let Some(done) = rx.recv().await {
        let key = (done.peer.to_string(), done.id, done.seq);
        let flight = pinger.in_flight.lock().expect("in-flight lock poisoned").remove(&key);
        match flight {
            Some(flight) => {
                flight.request.lock().expect("echo request lock poisoned").received =
                    Some(done.received);
                flight.latch.complete_one();
            }
            None => debug!(peer = %done.peer, id = done.id, seq = done.seq, "unexpected echo response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_releases_after_all_completions() {
        let latch = Arc::new(CallLatch::new(3));
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        latch.complete_one();
        latch.complete_one();
        assert!(!waiter.is_finished());
        latch.complete_one();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn latch_wait_returns_immediately_when_already_done() {
        let latch = CallLatch::new(1);
        latch.complete_one();
        tokio::time::timeout(Duration::from_secs(1), latch.wait()).await.unwrap();
    }

    // Exercises the full send/receive path against the loopback address.
    // Needs CAP_NET_RAW, so it is ignored by default.
    #[tokio::test]
    #[ignore]
    async fn pings_loopback() {
        let pinger = Arc::new(Pinger::new(IpProtocol::V4Only).unwrap());
        pinger.start().unwrap();

        let stats = pinger
            .ping("127.0.0.1".parse().unwrap(), 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.received, 5);
        assert_eq!(stats.latency.len(), stats.received);
        // steady state: nothing left in the in-flight table
        assert_eq!(pinger.in_flight_len(), 0);

        pinger.stop().await;
        assert!(matches!(
            pinger.ping("127.0.0.1".parse().unwrap(), 1, Duration::from_secs(1)).await,
            Err(PingError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn refuses_unsupported_family() {
        // construction itself needs privileges; skip when unavailable
        let Ok(pinger) = Pinger::new(IpProtocol::V4Only) else { return };
        let err = pinger
            .ping("::1".parse().unwrap(), 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PingError::UnsupportedFamily("ipv6")));
    }
}
