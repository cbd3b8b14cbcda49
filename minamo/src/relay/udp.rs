//! Session-oriented UDP relay service.
//!
//! Incoming datagrams are grouped into sessions by the 64-bit client session
//! ID, unpacked in place, and queued to a per-session uplink worker that
//! writes them to a per-session upstream socket. A downlink worker relays
//! upstream replies back to the most recently observed client address.
//! Sessions are evicted after `nat_timeout` of upstream read idleness.

use std::collections::hash_map::Entry;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use minamo_proto::socks5::Address;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::packet::{
    max_packet_size_for_addr, relay_headroom, ClientPacker, ClientUnpacker, Headroom, PacketPool,
    QueuedPacket, ServerPacker, UdpSessionServer, IPV4_HEADER_LEN, UDP_HEADER_LEN,
};
use super::session::{SessionEntry, SessionShared, SessionTable};
use crate::net;
use crate::router::{RequestInfo, Router};
use crate::stats::Collector;

/// How the relay moves packets at the socket boundary.
///
/// `Batched` amortizes channel dequeues, socket reads, and deadline
/// refreshes over up to a batch of packets; `Generic` handles one packet at
/// a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvMode {
    Generic,
    Batched,
}

impl RecvMode {
    pub fn from_batch_mode(batch_mode: &str) -> RecvMode {
        match batch_mode {
            "" | "sendmmsg" => RecvMode::Batched,
            _ => RecvMode::Generic,
        }
    }
}

/// Construction-time settings for a UDP session relay.
#[derive(Clone, Debug)]
pub struct UdpRelaySettings {
    pub server_name: String,
    pub listen_address: SocketAddr,
    pub listener_fwmark: u32,
    pub mtu: usize,
    pub relay_batch_size: usize,
    pub server_recv_batch_size: usize,
    pub send_channel_capacity: usize,
    pub nat_timeout: Duration,
    pub batch_mode: String,
    /// Worst-case headroom any routed client packer may use, so pooled
    /// buffers fit every route.
    pub max_client_packer_headroom: Headroom,
}

pub struct UdpSessionRelay {
    inner: Arc<RelayInner>,
    ingress: Mutex<Option<JoinHandle<()>>>,
}

struct RelayInner {
    server_name: String,
    listen_address: SocketAddr,
    listener_fwmark: u32,
    mtu: usize,
    front_headroom: usize,
    recv_size: usize,
    relay_batch_size: usize,
    server_recv_batch_size: usize,
    send_channel_capacity: usize,
    nat_timeout: Duration,
    recv_mode: RecvMode,
    server: Arc<dyn UdpSessionServer>,
    collector: Arc<dyn Collector>,
    router: Arc<Router>,
    pool: PacketPool,
    table: Mutex<SessionTable>,
    listener: ArcSwapOption<UdpSocket>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    packets_dropped_full: AtomicU64,
}

impl UdpSessionRelay {
    pub fn new(
        settings: UdpRelaySettings,
        server: Arc<dyn UdpSessionServer>,
        collector: Arc<dyn Collector>,
        router: Arc<Router>,
    ) -> UdpSessionRelay {
        let headroom = relay_headroom(
            settings.max_client_packer_headroom,
            server.info().unpacker_headroom,
        );
        let recv_size = settings.mtu - IPV4_HEADER_LEN - UDP_HEADER_LEN;
        let inner = RelayInner {
            server_name: settings.server_name,
            listen_address: settings.listen_address,
            listener_fwmark: settings.listener_fwmark,
            mtu: settings.mtu,
            front_headroom: headroom.front,
            recv_size,
            relay_batch_size: settings.relay_batch_size,
            server_recv_batch_size: settings.server_recv_batch_size,
            send_channel_capacity: settings.send_channel_capacity,
            nat_timeout: settings.nat_timeout,
            recv_mode: RecvMode::from_batch_mode(&settings.batch_mode),
            server,
            collector,
            router,
            pool: PacketPool::new(headroom.front + recv_size + headroom.rear),
            table: Mutex::new(SessionTable::new()),
            listener: ArcSwapOption::const_empty(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            packets_dropped_full: AtomicU64::new(0),
        };
        UdpSessionRelay {
            inner: Arc::new(inner),
            ingress: Mutex::new(None),
        }
    }

    /// Binds the listener socket and spawns the ingress loop.
    pub async fn start(&self) -> Result<()> {
        if self.inner.listener.load().is_some() {
            bail!("UDP session relay is already running");
        }

        let listener = Arc::new(
            net::listen_udp(self.inner.listen_address, self.inner.listener_fwmark)
                .context("binding UDP relay listener")?,
        );
        self.inner.listener.store(Some(listener.clone()));

        let inner = self.inner.clone();
        *self.ingress.lock() = Some(tokio::spawn(async move {
            RelayInner::recv_from_listener(inner, listener).await;
        }));

        info!(
            server = %self.inner.server_name,
            listen_address = %self.listen_addr().unwrap_or(self.inner.listen_address),
            "started UDP session relay service"
        );
        Ok(())
    }

    /// Quiesces ingress, unblocks every per-session upstream read, waits for
    /// the workers to drain, then closes the listener.
    pub async fn stop(&self) -> Result<()> {
        let Some(listener) = self.inner.listener.load_full() else {
            return Ok(());
        };

        // No new sessions once the ingress loop has exited.
        self.inner.shutdown.cancel();
        let handle = self.ingress.lock().take();
        if let Some(handle) = handle {
            handle.await.context("ingress task failed")?;
        }

        {
            let table = self.inner.table.lock();
            for entry in table.values() {
                // The listener stands in as the shutdown sentinel. A prior
                // value of None means the initializer has not published yet;
                // its own teardown path owns the cleanup.
                let prior = entry.shared.state.swap(Some(listener.clone()));
                if prior.is_some() {
                    entry.shared.cancel.cancel();
                }
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.listener.store(None);

        info!(
            server = %self.inner.server_name,
            packets_dropped_full = self.inner.packets_dropped_full.load(Ordering::Relaxed),
            "stopped UDP session relay service"
        );
        Ok(())
    }

    /// The bound listener address while running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .load_full()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn session_count(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Packet buffers currently borrowed from the pool.
    pub fn pool_outstanding(&self) -> usize {
        self.inner.pool.outstanding()
    }

    /// Packets dropped because a session's send channel was full.
    pub fn packets_dropped_full(&self) -> u64 {
        self.inner.packets_dropped_full.load(Ordering::Relaxed)
    }
}

impl RelayInner {
    async fn recv_from_listener(inner: Arc<RelayInner>, listener: Arc<UdpSocket>) {
        let front = inner.front_headroom;
        let mut batch: Vec<(QueuedPacket, usize, SocketAddr)> =
            Vec::with_capacity(inner.server_recv_batch_size);
        let mut packets_received: u64 = 0;

        loop {
            let mut qp = inner.pool.get();
            let first = tokio::select! {
                _ = inner.shutdown.cancelled() => None,
                r = listener.recv_from(&mut qp.buf[front..front + inner.recv_size]) => Some(r),
            };
            let (n, client_addr) = match first {
                None => {
                    inner.pool.put(qp);
                    break;
                }
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    warn!(
                        server = %inner.server_name,
                        error = %e,
                        "failed to read packet from listener"
                    );
                    inner.pool.put(qp);
                    continue;
                }
            };
            batch.push((qp, n, client_addr));

            if inner.recv_mode == RecvMode::Batched {
                while batch.len() < inner.server_recv_batch_size {
                    let mut qp = inner.pool.get();
                    match listener.try_recv_from(&mut qp.buf[front..front + inner.recv_size]) {
                        Ok((n, addr)) => batch.push((qp, n, addr)),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            inner.pool.put(qp);
                            break;
                        }
                        Err(e) => {
                            warn!(
                                server = %inner.server_name,
                                error = %e,
                                "failed to read packet from listener"
                            );
                            inner.pool.put(qp);
                            break;
                        }
                    }
                }
            }

            packets_received += batch.len() as u64;

            let mut table = inner.table.lock();
            for (qp, n, client_addr) in batch.drain(..) {
                Self::process_packet(&inner, &mut table, &listener, qp, n, client_addr);
            }
        }

        info!(
            server = %inner.server_name,
            packets_received,
            "finished receiving from listener"
        );
    }

    /// Classifies one received datagram into a session, unpacking it in
    /// place and queueing it to the session's uplink. Runs under the
    /// session-table lock; never blocks.
    fn process_packet(
        inner: &Arc<RelayInner>,
        table: &mut SessionTable,
        listener: &Arc<UdpSocket>,
        mut qp: QueuedPacket,
        n: usize,
        client_addr: SocketAddr,
    ) {
        let front = inner.front_headroom;
        // Portable builds carry no control-message surface; the pktinfo
        // byte string is empty and the cache machinery treats it as opaque.
        let pktinfo = Bytes::new();

        let csid = match inner.server.session_info(&qp.buf[front..front + n]) {
            Ok(csid) => csid,
            Err(e) => {
                warn!(
                    server = %inner.server_name,
                    client_address = %client_addr,
                    packet_length = n,
                    error = %e,
                    "failed to extract session info from packet"
                );
                inner.pool.put(qp);
                return;
            }
        };

        match table.entry(csid) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match entry.unpacker.unpack_in_place(&mut qp.buf, client_addr, front, n) {
                    Ok((target, start, len)) => {
                        qp.target = target;
                        qp.start = start;
                        qp.len = len;
                        qp.client_addr = client_addr;
                    }
                    Err(e) => {
                        warn!(
                            server = %inner.server_name,
                            client_address = %client_addr,
                            username = %entry.username,
                            client_session_id = csid,
                            error = %e,
                            "failed to unpack packet"
                        );
                        inner.pool.put(qp);
                        return;
                    }
                }
                entry.refresh_client_info(client_addr, &pktinfo);
                Self::enqueue(inner, entry, csid, qp);
            }
            Entry::Vacant(vacant) => {
                let (mut unpacker, username) =
                    match inner.server.new_unpacker(&qp.buf[front..front + n], csid) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                server = %inner.server_name,
                                client_address = %client_addr,
                                client_session_id = csid,
                                error = %e,
                                "failed to create unpacker for client session"
                            );
                            inner.pool.put(qp);
                            return;
                        }
                    };

                match unpacker.unpack_in_place(&mut qp.buf, client_addr, front, n) {
                    Ok((target, start, len)) => {
                        qp.target = target;
                        qp.start = start;
                        qp.len = len;
                        qp.client_addr = client_addr;
                    }
                    Err(e) => {
                        warn!(
                            server = %inner.server_name,
                            client_address = %client_addr,
                            username = %username,
                            client_session_id = csid,
                            error = %e,
                            "failed to unpack packet"
                        );
                        inner.pool.put(qp);
                        return;
                    }
                }

                // The reply-direction packer pairs with this unpacker; build
                // it before the session becomes visible so a failure leaves
                // no trace in the table.
                let server_packer = match unpacker.new_packer() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            server = %inner.server_name,
                            client_address = %client_addr,
                            username = %username,
                            client_session_id = csid,
                            error = %e,
                            "failed to create packer for client session"
                        );
                        inner.pool.put(qp);
                        return;
                    }
                };

                let shared = Arc::new(SessionShared::new(inner.nat_timeout));
                let (sender, receiver) = mpsc::channel(inner.send_channel_capacity);
                let mut entry = SessionEntry {
                    shared: shared.clone(),
                    sender,
                    unpacker,
                    username: username.clone(),
                    client_addr_cache: None,
                    client_pktinfo_cache: Bytes::new(),
                };
                entry.refresh_client_info(client_addr, &pktinfo);

                debug!(
                    server = %inner.server_name,
                    client_address = %client_addr,
                    target_address = %qp.target,
                    username = %username,
                    client_session_id = csid,
                    "new UDP session"
                );

                inner.tracker.spawn(Self::init_session(
                    inner.clone(),
                    csid,
                    shared,
                    receiver,
                    server_packer,
                    username,
                    client_addr,
                    qp.target.clone(),
                    listener.clone(),
                ));

                let entry = vacant.insert(entry);
                Self::enqueue(inner, entry, csid, qp);
            }
        }
    }

    /// Non-blocking enqueue to the session's uplink. A full channel drops
    /// the packet: newer packets are preferred to be delivered fresh.
    fn enqueue(inner: &RelayInner, entry: &SessionEntry, csid: u64, qp: QueuedPacket) {
        match entry.sender.try_send(qp) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(qp)) => {
                inner.packets_dropped_full.fetch_add(1, Ordering::Relaxed);
                debug!(
                    server = %inner.server_name,
                    client_address = %qp.client_addr,
                    target_address = %qp.target,
                    username = %entry.username,
                    client_session_id = csid,
                    "dropping packet due to full send channel"
                );
                inner.pool.put(qp);
            }
            Err(mpsc::error::TrySendError::Closed(qp)) => {
                debug!(
                    server = %inner.server_name,
                    client_session_id = csid,
                    "dropping packet due to closed send channel"
                );
                inner.pool.put(qp);
            }
        }
    }

    /// Sets up the upstream half of a new session, then runs the downlink
    /// worker to completion. Any failure before the state cell is published
    /// tears the session down cleanly.
    #[allow(clippy::too_many_arguments)]
    async fn init_session(
        inner: Arc<RelayInner>,
        csid: u64,
        shared: Arc<SessionShared>,
        receiver: mpsc::Receiver<QueuedPacket>,
        server_packer: Box<dyn ServerPacker>,
        username: String,
        client_addr: SocketAddr,
        target: Address,
        listener: Arc<UdpSocket>,
    ) {
        let client = match inner.router.get_udp_client(&RequestInfo {
            server: inner.server_name.clone(),
            username: username.clone(),
            source: client_addr,
            target: target.clone(),
        }) {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    server = %inner.server_name,
                    client_address = %client_addr,
                    target_address = %target,
                    username = %username,
                    client_session_id = csid,
                    error = %e,
                    "failed to get UDP client for new session"
                );
                return Self::teardown_early(&inner, csid, receiver);
            }
        };

        let (client_info, client_packer, client_unpacker) = match client.new_session() {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    server = %inner.server_name,
                    client_address = %client_addr,
                    target_address = %target,
                    username = %username,
                    client_session_id = csid,
                    error = %e,
                    "failed to create new upstream client session"
                );
                return Self::teardown_early(&inner, csid, receiver);
            }
        };

        let upstream = match net::listen_udp(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            client_info.fwmark,
        ) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(
                    server = %inner.server_name,
                    client = %client_info.name,
                    client_address = %client_addr,
                    target_address = %target,
                    username = %username,
                    client_session_id = csid,
                    fwmark = client_info.fwmark,
                    error = %e,
                    "failed to create upstream socket for new session"
                );
                return Self::teardown_early(&inner, csid, receiver);
            }
        };

        shared.refresh_deadline(inner.nat_timeout);

        // Publish. A non-empty prior value means shutdown beat us: release
        // the socket we just built and bow out.
        if shared.state.swap(Some(upstream.clone())).is_some() {
            drop(upstream);
            return Self::teardown_early(&inner, csid, receiver);
        }

        info!(
            server = %inner.server_name,
            client = %client_info.name,
            client_address = %client_addr,
            target_address = %target,
            username = %username,
            client_session_id = csid,
            "UDP session relay started"
        );

        inner.tracker.spawn(Self::uplink(
            inner.clone(),
            csid,
            receiver,
            client_packer,
            upstream.clone(),
            shared.clone(),
            username.clone(),
        ));

        Self::downlink(
            &inner,
            csid,
            &shared,
            upstream,
            listener,
            client_unpacker,
            server_packer,
            client_info.max_packet_size,
            &username,
        )
        .await;

        // Removing the entry drops the only sender; the uplink worker
        // drains whatever is still queued and exits.
        inner.table.lock().remove(&csid);
    }

    /// Teardown for sessions whose workers never started: remove the table
    /// entry, then drain residual queued packets back to the pool.
    fn teardown_early(inner: &RelayInner, csid: u64, mut receiver: mpsc::Receiver<QueuedPacket>) {
        inner.table.lock().remove(&csid);
        while let Ok(qp) = receiver.try_recv() {
            inner.pool.put(qp);
        }
    }

    /// Dequeues packets from the session's send channel, packs them in
    /// place, and writes them upstream until the channel closes.
    async fn uplink(
        inner: Arc<RelayInner>,
        csid: u64,
        mut receiver: mpsc::Receiver<QueuedPacket>,
        mut packer: Box<dyn ClientPacker>,
        upstream: Arc<UdpSocket>,
        shared: Arc<SessionShared>,
        username: String,
    ) {
        let mut packets_sent: u64 = 0;
        let mut payload_bytes_sent: u64 = 0;
        let mut batch: Vec<QueuedPacket> = Vec::with_capacity(inner.relay_batch_size);

        while let Some(first) = receiver.recv().await {
            batch.push(first);
            if inner.recv_mode == RecvMode::Batched {
                while batch.len() < inner.relay_batch_size {
                    match receiver.try_recv() {
                        Ok(qp) => batch.push(qp),
                        Err(_) => break,
                    }
                }
            }

            for mut qp in batch.drain(..) {
                let (dest, start, len) =
                    match packer.pack_in_place(&mut qp.buf, &qp.target, qp.start, qp.len) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                server = %inner.server_name,
                                client_address = %qp.client_addr,
                                target_address = %qp.target,
                                username = %username,
                                client_session_id = csid,
                                payload_length = qp.len,
                                error = %e,
                                "failed to pack packet"
                            );
                            inner.pool.put(qp);
                            continue;
                        }
                    };

                if let Err(e) = upstream.send_to(&qp.buf[start..start + len], dest).await {
                    warn!(
                        server = %inner.server_name,
                        client_address = %qp.client_addr,
                        target_address = %qp.target,
                        write_dest_address = %dest,
                        username = %username,
                        client_session_id = csid,
                        error = %e,
                        "failed to write packet to upstream socket"
                    );
                }

                packets_sent += 1;
                payload_bytes_sent += qp.len as u64;
                inner.pool.put(qp);
            }

            // One idle-deadline refresh per batch.
            shared.refresh_deadline(inner.nat_timeout);
        }

        info!(
            server = %inner.server_name,
            username = %username,
            client_session_id = csid,
            packets_sent,
            payload_bytes_sent,
            "finished relay listener -> upstream"
        );
        inner
            .collector
            .collect_udp_session_uplink(&username, packets_sent, payload_bytes_sent);
    }

    /// Relays upstream replies back to the client until the idle deadline
    /// passes or shutdown cancels the session.
    #[allow(clippy::too_many_arguments)]
    async fn downlink(
        inner: &Arc<RelayInner>,
        csid: u64,
        shared: &Arc<SessionShared>,
        upstream: Arc<UdpSocket>,
        listener: Arc<UdpSocket>,
        mut unpacker: Box<dyn ClientUnpacker>,
        mut packer: Box<dyn ServerPacker>,
        upstream_recv_max: usize,
        username: &str,
    ) {
        let Some(mut client_info) = shared.client_addr_info.load_full() else {
            // Ingress publishes before the session becomes visible.
            warn!(
                server = %inner.server_name,
                client_session_id = csid,
                "session has no client address info"
            );
            return;
        };
        let mut client_addr = client_info.addr;
        let mut max_client_packet_size = max_packet_size_for_addr(inner.mtu, client_addr.ip());

        let headroom = relay_headroom(packer.headroom(), unpacker.headroom());
        let front = headroom.front;
        let buf_size = front + upstream_recv_max + headroom.rear;
        let batch_size = match inner.recv_mode {
            RecvMode::Generic => 1,
            RecvMode::Batched => inner.relay_batch_size,
        };
        let mut bufs: Vec<Vec<u8>> = (0..batch_size).map(|_| vec![0u8; buf_size]).collect();
        let mut received: Vec<(usize, SocketAddr)> = Vec::with_capacity(batch_size);

        let mut packets_sent: u64 = 0;
        let mut payload_bytes_sent: u64 = 0;

        enum Wake {
            Cancelled,
            DeadlineFired,
            Recv(std::io::Result<(usize, SocketAddr)>),
        }

        'relay: loop {
            received.clear();

            let deadline = *shared.deadline.lock();
            let wake = tokio::select! {
                _ = shared.cancel.cancelled() => Wake::Cancelled,
                _ = sleep_until(deadline) => Wake::DeadlineFired,
                r = upstream.recv_from(&mut bufs[0][front..front + upstream_recv_max]) => Wake::Recv(r),
            };
            match wake {
                Wake::Cancelled => break 'relay,
                Wake::DeadlineFired => {
                    // The uplink may have pushed the deadline out since this
                    // sleep was armed; only a still-expired deadline means
                    // the session is idle.
                    if *shared.deadline.lock() <= Instant::now() {
                        break 'relay;
                    }
                    continue 'relay;
                }
                Wake::Recv(Ok(v)) => received.push(v),
                Wake::Recv(Err(e)) => {
                    warn!(
                        server = %inner.server_name,
                        client_address = %client_addr,
                        username = %username,
                        client_session_id = csid,
                        error = %e,
                        "failed to read packet from upstream socket"
                    );
                    continue 'relay;
                }
            }

            while received.len() < batch_size {
                let buf = &mut bufs[received.len()];
                match upstream.try_recv_from(&mut buf[front..front + upstream_recv_max]) {
                    Ok(v) => received.push(v),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(
                            server = %inner.server_name,
                            client_address = %client_addr,
                            username = %username,
                            client_session_id = csid,
                            error = %e,
                            "failed to read packet from upstream socket"
                        );
                        break;
                    }
                }
            }

            // One client-address reload per batch; every packet in the
            // batch shares the destination.
            if let Some(current) = shared.client_addr_info.load_full() {
                if !Arc::ptr_eq(&current, &client_info) {
                    client_info = current;
                    client_addr = client_info.addr;
                    max_client_packet_size = max_packet_size_for_addr(inner.mtu, client_addr.ip());
                }
            }

            for (i, &(n, source)) in received.iter().enumerate() {
                let buf = &mut bufs[i];
                let (payload_source, payload_start, payload_len) =
                    match unpacker.unpack_in_place(buf, source, front, n) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                server = %inner.server_name,
                                client_address = %client_addr,
                                packet_source_address = %source,
                                username = %username,
                                client_session_id = csid,
                                packet_length = n,
                                error = %e,
                                "failed to unpack packet"
                            );
                            continue;
                        }
                    };

                let (start, len) = match packer.pack_in_place(
                    buf,
                    &payload_source,
                    payload_start,
                    payload_len,
                    max_client_packet_size,
                ) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            server = %inner.server_name,
                            client_address = %client_addr,
                            payload_source_address = %payload_source,
                            username = %username,
                            client_session_id = csid,
                            payload_length = payload_len,
                            max_client_packet_size,
                            error = %e,
                            "failed to pack packet"
                        );
                        continue;
                    }
                };

                if let Err(e) = listener.send_to(&buf[start..start + len], client_addr).await {
                    warn!(
                        server = %inner.server_name,
                        client_address = %client_addr,
                        username = %username,
                        client_session_id = csid,
                        error = %e,
                        "failed to write packet to listener"
                    );
                }

                packets_sent += 1;
                payload_bytes_sent += payload_len as u64;
            }
        }

        info!(
            server = %inner.server_name,
            client_address = %client_addr,
            username = %username,
            client_session_id = csid,
            packets_sent,
            payload_bytes_sent,
            "finished relay listener <- upstream"
        );
        inner
            .collector
            .collect_udp_session_downlink(username, packets_sent, payload_bytes_sent);
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::super::plain::{DirectClient, PlainSessionServer, PlainTunnelClient};
    use super::*;
    use crate::router::{ClientInfo, UdpClient};
    use crate::stats::AtomicCollector;

    fn settings(nat_timeout: Duration, batch_mode: &str, capacity: usize) -> UdpRelaySettings {
        UdpRelaySettings {
            server_name: "test".to_owned(),
            listen_address: "127.0.0.1:0".parse().unwrap(),
            listener_fwmark: 0,
            mtu: 1500,
            relay_batch_size: 8,
            server_recv_batch_size: 8,
            send_channel_capacity: capacity,
            nat_timeout,
            batch_mode: batch_mode.to_owned(),
            max_client_packer_headroom: Headroom::default(),
        }
    }

    fn relay_with_client(
        settings: UdpRelaySettings,
        client: Arc<dyn UdpClient>,
    ) -> (UdpSessionRelay, Arc<AtomicCollector>) {
        let collector = Arc::new(AtomicCollector::new());
        let relay = UdpSessionRelay::new(
            settings,
            Arc::new(PlainSessionServer::new()),
            collector.clone(),
            Arc::new(Router::new(client)),
        );
        (relay, collector)
    }

    fn client_packet(session_id: u64, addr: &Address, payload: &[u8]) -> Vec<u8> {
        let mut wire = session_id.to_be_bytes().to_vec();
        addr.write_to_buf(&mut wire);
        wire.extend_from_slice(payload);
        wire
    }

    async fn spawn_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn recv_with_timeout(socket: &UdpSocket, buf: &mut [u8]) -> (usize, SocketAddr) {
        timeout(Duration::from_secs(5), socket.recv_from(buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_packet_roundtrip() {
        let echo_addr = spawn_echo().await;
        let (relay, collector) = relay_with_client(
            settings(Duration::from_secs(30), "", 512),
            Arc::new(DirectClient::new("direct".to_owned(), 1500, 0)),
        );
        relay.start().await.unwrap();
        let listen = relay.listen_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Address::Ip(echo_addr);
        client
            .send_to(&client_packet(42, &target, b"ping"), listen)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (n, from) = recv_with_timeout(&client, &mut buf).await;
        assert_eq!(from, listen);
        assert_eq!(&buf[..n], client_packet(42, &Address::Ip(echo_addr), b"ping").as_slice());

        relay.stop().await.unwrap();
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.pool_outstanding(), 0);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.uplink_packets, 1);
        assert_eq!(snapshot.uplink_bytes, 4);
        assert_eq!(snapshot.downlink_packets, 1);
        assert_eq!(snapshot.downlink_bytes, 4);
    }

    #[tokio::test]
    async fn test_generic_mode_roundtrip() {
        let echo_addr = spawn_echo().await;
        let (relay, _) = relay_with_client(
            settings(Duration::from_secs(30), "generic", 512),
            Arc::new(DirectClient::new("direct".to_owned(), 1500, 0)),
        );
        relay.start().await.unwrap();
        let listen = relay.listen_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Address::Ip(echo_addr);
        for payload in [b"one".as_slice(), b"two", b"three"] {
            client
                .send_to(&client_packet(7, &target, payload), listen)
                .await
                .unwrap();
            let mut buf = [0u8; 2048];
            let (n, _) = recv_with_timeout(&client, &mut buf).await;
            assert_eq!(&buf[..n], client_packet(7, &Address::Ip(echo_addr), payload).as_slice());
        }

        relay.stop().await.unwrap();
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.pool_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let echo_addr = spawn_echo().await;
        let (relay, _) = relay_with_client(
            settings(Duration::from_secs(30), "", 512),
            Arc::new(DirectClient::new("direct".to_owned(), 1500, 0)),
        );
        relay.start().await.unwrap();
        let listen = relay.listen_addr().unwrap();
        let target = Address::Ip(echo_addr);

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_a
            .send_to(&client_packet(1, &target, b"from-a"), listen)
            .await
            .unwrap();
        client_b
            .send_to(&client_packet(2, &target, b"from-b"), listen)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = recv_with_timeout(&client_a, &mut buf).await;
        assert_eq!(&buf[..n], client_packet(1, &Address::Ip(echo_addr), b"from-a").as_slice());
        let (n, _) = recv_with_timeout(&client_b, &mut buf).await;
        assert_eq!(&buf[..n], client_packet(2, &Address::Ip(echo_addr), b"from-b").as_slice());

        assert_eq!(relay.session_count(), 2);

        relay.stop().await.unwrap();
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.pool_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_idle_session_is_evicted() {
        // A target that never answers leaves the downlink idle.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink.local_addr().unwrap();

        let (relay, _) = relay_with_client(
            settings(Duration::from_millis(300), "", 512),
            Arc::new(DirectClient::new("direct".to_owned(), 1500, 0)),
        );
        relay.start().await.unwrap();
        let listen = relay.listen_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&client_packet(9, &Address::Ip(sink_addr), b"hello"), listen)
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while relay.session_count() != 0 {
            assert!(Instant::now() < deadline, "idle session was never evicted");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(relay.pool_outstanding(), 0);

        relay.stop().await.unwrap();
    }

    /// An upstream client whose session setup stalls, then fails. While it
    /// stalls, the session's send channel stays unconsumed.
    struct StallClient {
        delay: Duration,
    }

    impl UdpClient for StallClient {
        fn new_session(
            &self,
        ) -> Result<(ClientInfo, Box<dyn ClientPacker>, Box<dyn ClientUnpacker>)> {
            std::thread::sleep(self.delay);
            bail!("no route to upstream")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_send_channel_drops_packet() {
        let (relay, _) = relay_with_client(
            settings(Duration::from_secs(30), "", 1),
            Arc::new(StallClient {
                delay: Duration::from_millis(300),
            }),
        );
        relay.start().await.unwrap();
        let listen = relay.listen_addr().unwrap();

        let target = Address::Ip("127.0.0.1:9".parse().unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Capacity 1: the first packet queues, the second is dropped.
        client
            .send_to(&client_packet(3, &target, b"first"), listen)
            .await
            .unwrap();
        client
            .send_to(&client_packet(3, &target, b"second"), listen)
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while relay.packets_dropped_full() != 1 {
            assert!(Instant::now() < deadline, "overflow packet was never dropped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        relay.stop().await.unwrap();
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.pool_outstanding(), 0);
        assert_eq!(relay.packets_dropped_full(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_route_reframes_upstream() {
        // Stand-in next-hop relay: strips the tunnel header, answers with
        // the same session ID and a fixed payload source.
        let next_hop = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let next_hop_addr = next_hop.local_addr().unwrap();
        let reply_source = Address::Ip("198.51.100.4:443".parse().unwrap());
        let reply_source_task = reply_source.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = next_hop.recv_from(&mut buf).await {
                let mut sid = [0u8; 8];
                sid.copy_from_slice(&buf[..8]);
                let (_target, consumed) = Address::from_slice(&buf[8..n]).unwrap();
                let payload = buf[8 + consumed..n].to_vec();

                let mut reply = sid.to_vec();
                reply_source_task.write_to_buf(&mut reply);
                reply.extend_from_slice(&payload);
                let _ = next_hop.send_to(&reply, from).await;
            }
        });

        let mut s = settings(Duration::from_secs(30), "", 512);
        s.max_client_packer_headroom = Headroom {
            front: 8 + minamo_proto::socks5::MAX_ADDR_LEN,
            rear: 0,
        };
        let (relay, _) = relay_with_client(
            s,
            Arc::new(PlainTunnelClient::new(
                "next-hop".to_owned(),
                next_hop_addr,
                1500,
                0,
            )),
        );
        relay.start().await.unwrap();
        let listen = relay.listen_addr().unwrap();

        let target = Address::Domain("example.com".to_owned(), 443);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&client_packet(11, &target, b"payload"), listen)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = recv_with_timeout(&client, &mut buf).await;
        assert_eq!(&buf[..n], client_packet(11, &reply_source, b"payload").as_slice());

        relay.stop().await.unwrap();
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.pool_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_any_traffic() {
        let (relay, _) = relay_with_client(
            settings(Duration::from_secs(30), "", 512),
            Arc::new(DirectClient::new("direct".to_owned(), 1500, 0)),
        );
        relay.start().await.unwrap();
        relay.stop().await.unwrap();
        assert!(relay.listen_addr().is_none());

        // Stopping an already-stopped relay is a no-op.
        relay.stop().await.unwrap();
    }

    #[test]
    fn test_recv_mode_selection() {
        assert_eq!(RecvMode::from_batch_mode(""), RecvMode::Batched);
        assert_eq!(RecvMode::from_batch_mode("sendmmsg"), RecvMode::Batched);
        assert_eq!(RecvMode::from_batch_mode("generic"), RecvMode::Generic);
        assert_eq!(RecvMode::from_batch_mode("anything"), RecvMode::Generic);
    }
}
