//! IEC 60870-5-104 server (controlled station).
//!
//! The server accepts TCP connections from masters, groups them into
//! redundancy groups and sends the group's queued events to the one active
//! connection of each group. Requests from masters are dispatched to a
//! [`SlaveHandler`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::apci::{Apci, UFunction};
use super::codec::{Apdu, ApduCodec};
use super::link::{ApciState, TimerAction};
use super::queue::EventQueue;
use crate::error::{Iec60870Error, Result};
use crate::handler::{dispatch, PeerConnectionEvent, Responder, SlaveHandler};
use crate::params::{ApciParameters, AppLayerParameters};
use crate::types::{Asdu, Cot, DataPoint, DataValue, Quality, TypeId};

/// Default capacity of each event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default capacity of the per-connection response queue.
pub const DEFAULT_RESPONSE_CAPACITY: usize = 100;

/// Default limit of simultaneously open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

const TIMER_TICK: Duration = Duration::from_millis(100);

/// How connections share event queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// All connections form one group with one shared queue; only one of
    /// them is active at a time.
    #[default]
    SingleRedundancyGroup,
    /// Every connection has its own queue and receives every event.
    ConnectionIsRedundancyGroup,
    /// Connections are assigned to configured groups by peer IP address.
    MultipleRedundancyGroups,
}

/// Redundancy group definition for [`ServerMode::MultipleRedundancyGroups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundancyGroup {
    /// Group name used in log output
    pub name: String,
    /// Peer addresses belonging to this group. Empty means any peer.
    pub allowed: Vec<IpAddr>,
}

impl RedundancyGroup {
    /// Create a group without members (catch-all).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: Vec::new(),
        }
    }

    /// Add an allowed peer address.
    pub fn allow(mut self, ip: IpAddr) -> Self {
        self.allowed.push(ip);
        self
    }

    /// True if the group accepts any peer.
    pub fn is_catch_all(&self) -> bool {
        self.allowed.is_empty()
    }

    /// True if `ip` is listed for this group.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.allowed.contains(&ip)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// Local address to bind (host:port)
    pub bind_address: String,
    /// Maximum number of open connections
    pub max_connections: usize,
    /// Redundancy mode
    pub mode: ServerMode,
    /// Groups used with [`ServerMode::MultipleRedundancyGroups`]
    pub redundancy_groups: Vec<RedundancyGroup>,
    /// Capacity of each event queue
    pub queue_capacity: usize,
    /// Capacity of the response queue of each connection
    pub response_capacity: usize,
    /// APCI parameters
    pub apci: ApciParameters,
    /// Application layer parameters
    pub app: AppLayerParameters,
}

impl SlaveConfig {
    /// Create a configuration listening on `bind_address`.
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            mode: ServerMode::default(),
            redundancy_groups: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
            apci: ApciParameters::default(),
            app: AppLayerParameters::cs104(),
        }
    }

    /// Set maximum number of open connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set server mode.
    pub fn mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a redundancy group.
    pub fn redundancy_group(mut self, group: RedundancyGroup) -> Self {
        self.redundancy_groups.push(group);
        self
    }

    /// Set event queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set response queue capacity.
    pub fn response_capacity(mut self, capacity: usize) -> Self {
        self.response_capacity = capacity;
        self
    }

    /// Set APCI parameters.
    pub fn apci_parameters(mut self, params: ApciParameters) -> Self {
        self.apci = params;
        self
    }

    /// Set application layer parameters.
    pub fn app_layer_parameters(mut self, params: AppLayerParameters) -> Self {
        self.app = params;
        self
    }

    /// Check all parameters.
    pub fn validate(&self) -> Result<()> {
        self.apci.validate()?;
        self.app.validate()?;
        if self.max_connections == 0 {
            return Err(Iec60870Error::config("max_connections must be non-zero"));
        }
        if self.queue_capacity == 0 || self.response_capacity == 0 {
            return Err(Iec60870Error::config("queue capacities must be non-zero"));
        }
        if self.mode == ServerMode::MultipleRedundancyGroups && self.redundancy_groups.is_empty() {
            return Err(Iec60870Error::config(
                "multiple redundancy groups mode requires at least one group",
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct Group {
    name: String,
    allowed: Vec<IpAddr>,
    queue: Arc<EventQueue>,
    active: Mutex<Option<u64>>,
}

impl Group {
    fn new(name: impl Into<String>, allowed: Vec<IpAddr>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            allowed,
            queue: Arc::new(EventQueue::new(capacity)),
            active: Mutex::new(None),
        }
    }
}

enum Control {
    Deactivate,
    Close,
}

struct ConnectionEntry {
    peer: SocketAddr,
    control: mpsc::Sender<Control>,
}

struct Shared {
    config: SlaveConfig,
    handler: Arc<dyn SlaveHandler>,
    groups: Mutex<Vec<Arc<Group>>>,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl Shared {
    fn group_for(&self, peer: IpAddr) -> Option<Arc<Group>> {
        match self.config.mode {
            ServerMode::SingleRedundancyGroup => lock(&self.groups).first().cloned(),
            ServerMode::ConnectionIsRedundancyGroup => {
                let group = Arc::new(Group::new(
                    peer.to_string(),
                    vec![peer],
                    self.config.queue_capacity,
                ));
                lock(&self.groups).push(group.clone());
                Some(group)
            }
            ServerMode::MultipleRedundancyGroups => {
                let groups = lock(&self.groups);
                groups
                    .iter()
                    .find(|g| g.allowed.contains(&peer))
                    .or_else(|| groups.iter().find(|g| g.allowed.is_empty()))
                    .cloned()
            }
        }
    }

    /// Make `id` the active connection of `group` and deactivate the previous one.
    fn activate(&self, group: &Group, id: u64) {
        let previous = lock(&group.active).replace(id);
        if let Some(previous) = previous.filter(|p| *p != id) {
            if let Some(entry) = lock(&self.connections).get(&previous) {
                debug!(group = %group.name, previous = %entry.peer, "deactivating connection");
                let _ = entry.control.try_send(Control::Deactivate);
            }
        }
    }

    fn release(&self, group: &Group, id: u64) {
        let mut active = lock(&group.active);
        if *active == Some(id) {
            *active = None;
        }
    }

    fn remove_connection(&self, id: u64, group: &Arc<Group>) {
        lock(&self.connections).remove(&id);
        if self.config.mode == ServerMode::ConnectionIsRedundancyGroup {
            lock(&self.groups).retain(|g| !Arc::ptr_eq(g, group));
        }
    }
}

/// IEC 60870-5-104 server.
///
/// # Example
///
/// ```rust,ignore
/// let config = SlaveConfig::new("0.0.0.0:2404");
/// let mut slave = Slave::new(config, Arc::new(MyStation::default()));
/// let addr = slave.start().await?;
/// slave.enqueue_asdu(asdu)?;
/// ```
pub struct Slave {
    shared: Arc<Shared>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Slave {
    /// Create a server; nothing is bound until [`Slave::start`].
    pub fn new(config: SlaveConfig, handler: Arc<dyn SlaveHandler>) -> Self {
        let groups = match config.mode {
            ServerMode::SingleRedundancyGroup => {
                vec![Arc::new(Group::new("default", Vec::new(), config.queue_capacity))]
            }
            ServerMode::ConnectionIsRedundancyGroup => Vec::new(),
            ServerMode::MultipleRedundancyGroups => config
                .redundancy_groups
                .iter()
                .map(|g| Arc::new(Group::new(g.name.clone(), g.allowed.clone(), config.queue_capacity)))
                .collect(),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                groups: Mutex::new(groups),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            shutdown: None,
            task: None,
            local_addr: None,
        }
    }

    /// Bind the listener and spawn the accept loop. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(Iec60870Error::Connection("Server already running".to_string()));
        }
        self.shared.config.validate()?;

        let listener = TcpListener::bind(&self.shared.config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, mode = ?self.shared.config.mode, "slave listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.task = Some(tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            shutdown_rx,
        )));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, close all connections and wait for them to finish.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Iec60870Error::Internal(format!("accept task failed: {}", e)))?;
        }
        self.local_addr = None;
        info!("slave stopped");
        Ok(())
    }

    /// True while the accept loop runs.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Queue a spontaneous or periodic ASDU for every redundancy group.
    pub fn enqueue_asdu(&self, asdu: Asdu) -> Result<()> {
        asdu.encode_with(&mut BytesMut::new(), &self.shared.config.app)?;
        for group in lock(&self.shared.groups).iter() {
            group.queue.enqueue(asdu.clone());
        }
        Ok(())
    }

    /// Queue a single-point information (M_SP_NA_1).
    pub fn send_single_point(
        &self,
        cot: Cot,
        ca: u16,
        ioa: u32,
        value: bool,
        quality: Quality,
    ) -> Result<()> {
        self.send_point(TypeId::SinglePoint, cot, ca, ioa, DataValue::Single(value), quality)
    }

    /// Queue a scaled measured value (M_ME_NB_1).
    pub fn send_measured_scaled(
        &self,
        cot: Cot,
        ca: u16,
        ioa: u32,
        value: i16,
        quality: Quality,
    ) -> Result<()> {
        self.send_point(TypeId::MeasuredScaled, cot, ca, ioa, DataValue::Scaled(value), quality)
    }

    /// Queue a short floating point measured value (M_ME_NC_1).
    pub fn send_measured_float(
        &self,
        cot: Cot,
        ca: u16,
        ioa: u32,
        value: f32,
        quality: Quality,
    ) -> Result<()> {
        self.send_point(TypeId::MeasuredFloat, cot, ca, ioa, DataValue::Float(value), quality)
    }

    fn send_point(
        &self,
        type_id: TypeId,
        cot: Cot,
        ca: u16,
        ioa: u32,
        value: DataValue,
        quality: Quality,
    ) -> Result<()> {
        let point = DataPoint::with_quality(ioa, value, quality);
        self.enqueue_asdu(Asdu::from_points(type_id, cot, ca, false, &[point])?)
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Some(session) = accept(&shared, stream, peer) {
                        sessions.spawn(session.run());
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    let controls: Vec<_> = lock(&shared.connections)
        .values()
        .map(|c| c.control.clone())
        .collect();
    for control in controls {
        let _ = control.send(Control::Close).await;
    }
    while sessions.join_next().await.is_some() {}
}

fn accept(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Option<Session> {
    let open = lock(&shared.connections).len();
    if open >= shared.config.max_connections {
        warn!(%peer, open, "connection limit reached, rejecting");
        return None;
    }
    if !shared.handler.accept_connection(peer) {
        info!(%peer, "connection rejected by handler");
        return None;
    }
    let Some(group) = shared.group_for(peer.ip()) else {
        warn!(%peer, "no redundancy group for peer, rejecting");
        return None;
    };
    stream.set_nodelay(true).ok();

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (control_tx, control_rx) = mpsc::channel(4);
    let (response_tx, response_rx) = mpsc::channel(shared.config.response_capacity);
    lock(&shared.connections).insert(
        id,
        ConnectionEntry {
            peer,
            control: control_tx,
        },
    );
    info!(%peer, id, group = %group.name, "connection opened");

    Some(Session {
        responder: MasterConnection {
            id,
            peer,
            app: shared.config.app,
            responses: response_tx,
        },
        framed: Framed::new(stream, ApduCodec::new(shared.config.app)),
        link: ApciState::new(shared.config.apci, Instant::now()),
        active: false,
        group,
        shared: shared.clone(),
        responses: response_rx,
        control: control_rx,
    })
}

/// Handle of a connected master, used to answer its requests.
#[derive(Debug, Clone)]
pub struct MasterConnection {
    id: u64,
    peer: SocketAddr,
    app: AppLayerParameters,
    responses: mpsc::Sender<Asdu>,
}

impl MasterConnection {
    /// Remote address of the master.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Server-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Responder for MasterConnection {
    fn app_layer_parameters(&self) -> AppLayerParameters {
        self.app
    }

    fn send_asdu(&self, asdu: Asdu) -> Result<()> {
        asdu.encode_with(&mut BytesMut::new(), &self.app)?;
        self.responses.try_send(asdu).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Iec60870Error::ChannelClosed,
        })
    }
}

struct Session {
    responder: MasterConnection,
    framed: Framed<TcpStream, ApduCodec>,
    link: ApciState,
    active: bool,
    group: Arc<Group>,
    shared: Arc<Shared>,
    responses: mpsc::Receiver<Asdu>,
    control: mpsc::Receiver<Control>,
}

impl Session {
    async fn run(mut self) {
        let peer = self.responder.peer;
        self.shared
            .handler
            .connection_event(peer, PeerConnectionEvent::Opened);

        let mut ticker = tokio::time::interval(TIMER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if let Err(e) = self.transmit().await {
                break Err(e);
            }
            let can_send = self.active && !self.link.is_window_full();

            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(apdu)) => {
                        if let Err(e) = self.handle_apdu(apdu).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                Some(asdu) = self.responses.recv(), if can_send => {
                    if let Err(e) = self.send_i_frame(asdu, None).await {
                        break Err(e);
                    }
                }
                _ = self.group.queue.notified(), if can_send => {}
                control = self.control.recv() => match control {
                    Some(Control::Deactivate) => self.deactivate(),
                    Some(Control::Close) | None => break Ok(()),
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick().await {
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown(result).await;
    }

    /// Send pending responses first, then queued events, while the window allows.
    async fn transmit(&mut self) -> Result<()> {
        while self.active && !self.link.is_window_full() {
            if let Ok(asdu) = self.responses.try_recv() {
                self.send_i_frame(asdu, None).await?;
            } else if let Some((id, asdu)) = self.group.queue.take_next() {
                self.send_i_frame(asdu, Some(id)).await?;
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn send_i_frame(&mut self, asdu: Asdu, tag: Option<u64>) -> Result<()> {
        let apci = self.link.next_i_frame(tag, Instant::now())?;
        self.framed.send(Apdu { apci, asdu: Some(asdu) }).await
    }

    async fn send_u_frame(&mut self, function: UFunction) -> Result<()> {
        self.framed.send(Apdu::u_frame(function)).await?;
        self.link.on_u_sent(function, Instant::now());
        Ok(())
    }

    async fn send_s_frame(&mut self) -> Result<()> {
        let apci = self.link.s_frame();
        self.framed.send(Apdu { apci, asdu: None }).await
    }

    async fn handle_apdu(&mut self, apdu: Apdu) -> Result<()> {
        let now = Instant::now();
        self.link.on_frame_received(now);

        match apdu.apci {
            Apci::IFrame { send_seq, recv_seq } => {
                let (confirmed, ack_now) = self.link.on_i_frame(send_seq, recv_seq, now)?;
                self.group.queue.confirm(&confirmed);

                match apdu.asdu {
                    Some(asdu) if self.active => {
                        let handler = self.shared.handler.clone();
                        if let Err(e) = dispatch(handler.as_ref(), &self.responder, &asdu) {
                            warn!(peer = %self.responder.peer, error = %e, "failed to handle ASDU");
                        }
                    }
                    Some(asdu) => {
                        debug!(type_id = %asdu.type_id(), "connection not active, ASDU ignored");
                    }
                    None => debug!(send_seq, "I-frame without decodable ASDU"),
                }

                if ack_now {
                    self.send_s_frame().await?;
                }
            }

            Apci::SFrame { recv_seq } => {
                let confirmed = self.link.on_ack(recv_seq)?;
                self.group.queue.confirm(&confirmed);
            }

            Apci::UFrame { function } => match function {
                UFunction::StartDtAct => {
                    self.shared.activate(&self.group, self.responder.id);
                    self.framed.send(Apdu::u_frame(UFunction::StartDtCon)).await?;
                    if !self.active {
                        self.active = true;
                        info!(peer = %self.responder.peer, "connection activated");
                        self.shared
                            .handler
                            .connection_event(self.responder.peer, PeerConnectionEvent::Activated);
                    }
                }
                UFunction::StopDtAct => {
                    if self.active {
                        self.shared.release(&self.group, self.responder.id);
                        self.deactivate();
                    }
                    self.framed.send(Apdu::u_frame(UFunction::StopDtCon)).await?;
                }
                UFunction::TestFrAct => {
                    self.framed.send(Apdu::u_frame(UFunction::TestFrCon)).await?;
                }
                UFunction::TestFrCon => {
                    self.link.on_u_confirm(function);
                }
                UFunction::StartDtCon | UFunction::StopDtCon => {
                    debug!(?function, "ignoring confirmation from controlling station");
                }
            },
        }
        Ok(())
    }

    fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let unconfirmed = self.link.release_unconfirmed();
        self.group.queue.requeue(&unconfirmed);
        info!(peer = %self.responder.peer, requeued = unconfirmed.len(), "connection deactivated");
        self.shared
            .handler
            .connection_event(self.responder.peer, PeerConnectionEvent::Deactivated);
    }

    async fn on_tick(&mut self) -> Result<()> {
        match self.link.poll_timers(Instant::now()) {
            Some(TimerAction::Close) => Err(Iec60870Error::T1Timeout),
            Some(TimerAction::SendSFrame) => self.send_s_frame().await,
            Some(TimerAction::SendTestFrame) => self.send_u_frame(UFunction::TestFrAct).await,
            None => Ok(()),
        }
    }

    async fn shutdown(mut self, result: Result<()>) {
        let peer = self.responder.peer;
        match &result {
            Ok(()) => info!(%peer, "connection closed"),
            Err(e) => warn!(%peer, error = %e, "connection closed"),
        }

        let _ = SinkExt::<Apdu>::close(&mut self.framed).await;
        let unconfirmed = self.link.release_unconfirmed();
        self.group.queue.requeue(&unconfirmed);
        self.shared.release(&self.group, self.responder.id);
        self.shared.remove_connection(self.responder.id, &self.group);
        self.shared
            .handler
            .connection_event(peer, PeerConnectionEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs104::{Connection, ConnectionConfig, ConnectionEvent};
    use crate::parser::parse_asdu;
    use crate::types::Command;
    use tokio::net::TcpSocket;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Station {
        events: Mutex<Vec<PeerConnectionEvent>>,
    }

    impl Station {
        fn events(&self) -> Vec<PeerConnectionEvent> {
            lock(&self.events).clone()
        }
    }

    impl SlaveHandler for Station {
        fn connection_event(&self, _peer: SocketAddr, event: PeerConnectionEvent) {
            lock(&self.events).push(event);
        }

        fn interrogation(&self, responder: &dyn Responder, asdu: &Asdu, _qoi: u8) -> bool {
            responder.send_act_con(asdu, false).unwrap();
            let points = [
                DataPoint::new(100, DataValue::Single(true)),
                DataPoint::new(101, DataValue::Single(false)),
            ];
            let data = Asdu::from_points(
                TypeId::SinglePoint,
                Cot::InterrogatedByStation,
                asdu.common_address(),
                false,
                &points,
            )
            .unwrap();
            responder.send_asdu(data).unwrap();
            responder.send_act_term(asdu).unwrap();
            true
        }
    }

    fn spontaneous(ioa: u32) -> Asdu {
        Asdu::from_points(
            TypeId::MeasuredScaled,
            Cot::Spontaneous,
            1,
            false,
            &[DataPoint::new(ioa, DataValue::Scaled(ioa as i16))],
        )
        .unwrap()
    }

    async fn start(config: SlaveConfig, handler: Arc<Station>) -> (Slave, SocketAddr) {
        let mut slave = Slave::new(config, handler);
        let addr = slave.start().await.unwrap();
        (slave, addr)
    }

    async fn raw_client(addr: SocketAddr) -> Framed<TcpStream, ApduCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        Framed::new(stream, ApduCodec::default())
    }

    async fn raw_client_from(local: &str, addr: SocketAddr) -> Framed<TcpStream, ApduCodec> {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(format!("{}:0", local).parse().unwrap()).unwrap();
        let stream = socket.connect(addr).await.unwrap();
        Framed::new(stream, ApduCodec::default())
    }

    fn first_ioa(apdu: Apdu) -> u32 {
        parse_asdu(&apdu.asdu.unwrap()).unwrap()[0].ioa
    }

    async fn recv(framed: &mut Framed<TcpStream, ApduCodec>) -> Option<Apdu> {
        timeout(Duration::from_secs(2), framed.next())
            .await
            .ok()
            .flatten()
            .and_then(|r| r.ok())
    }

    async fn start_dt(framed: &mut Framed<TcpStream, ApduCodec>) {
        framed.send(Apdu::u_frame(UFunction::StartDtAct)).await.unwrap();
        let con = recv(framed).await.unwrap();
        assert_eq!(con.apci, Apci::u_frame(UFunction::StartDtCon));
    }

    #[test]
    fn test_slave_config() {
        let config = SlaveConfig::new("0.0.0.0:2404")
            .max_connections(2)
            .queue_capacity(10);
        assert_eq!(config.mode, ServerMode::SingleRedundancyGroup);
        assert!(config.validate().is_ok());

        assert!(config.clone().max_connections(0).validate().is_err());
        assert!(config
            .clone()
            .mode(ServerMode::MultipleRedundancyGroups)
            .validate()
            .is_err());
        assert!(config
            .mode(ServerMode::MultipleRedundancyGroups)
            .redundancy_group(RedundancyGroup::new("scada"))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_redundancy_group_membership() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let group = RedundancyGroup::new("a").allow(ip);
        assert!(group.contains(ip));
        assert!(!group.is_catch_all());
        assert!(RedundancyGroup::new("any").is_catch_all());
    }

    #[tokio::test]
    async fn test_interrogation_with_client() {
        let station = Arc::new(Station::default());
        let (mut slave, addr) = start(SlaveConfig::new("127.0.0.1:0"), station.clone()).await;
        assert!(slave.is_running());
        assert_eq!(slave.local_addr(), Some(addr));

        let mut client = Connection::new(ConnectionConfig::new(addr.to_string()));
        let mut events = client.subscribe().unwrap();
        client.connect().await.unwrap();
        client.start_dt().await.unwrap();
        client.general_interrogation(1).await.unwrap();

        let mut confirmed = false;
        let mut points = Vec::new();
        loop {
            match timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(ConnectionEvent::CommandConfirm { success, .. })) => confirmed = success,
                Ok(Some(ConnectionEvent::DataUpdate { points: p, .. })) => points.extend(p),
                Ok(Some(ConnectionEvent::InterrogationComplete { ca })) => {
                    assert_eq!(ca, 1);
                    break;
                }
                Ok(Some(_)) => {}
                other => panic!("interrogation did not complete: {:?}", other),
            }
        }
        assert!(confirmed);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].ioa, 101);

        client.close().await.unwrap();
        slave.stop().await.unwrap();
        assert!(!slave.is_running());

        let events = station.events();
        assert_eq!(events.first(), Some(&PeerConnectionEvent::Opened));
        assert!(events.contains(&PeerConnectionEvent::Activated));
        assert_eq!(events.last(), Some(&PeerConnectionEvent::Closed));
    }

    #[tokio::test]
    async fn test_events_wait_for_start_dt() {
        let (mut slave, addr) = start(SlaveConfig::new("127.0.0.1:0"), Arc::default()).await;
        let mut master = raw_client(addr).await;

        slave.enqueue_asdu(spontaneous(1)).unwrap();
        assert!(timeout(Duration::from_millis(300), master.next()).await.is_err());

        start_dt(&mut master).await;
        let apdu = recv(&mut master).await.unwrap();
        assert_eq!(apdu.apci, Apci::i_frame(0, 0));
        assert_eq!(apdu.asdu.unwrap().cot(), Cot::Spontaneous);

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfirmed_events_move_to_new_active_connection() {
        let station = Arc::new(Station::default());
        let (mut slave, addr) = start(SlaveConfig::new("127.0.0.1:0"), station.clone()).await;

        let mut first = raw_client(addr).await;
        start_dt(&mut first).await;
        slave.enqueue_asdu(spontaneous(7)).unwrap();
        let apdu = recv(&mut first).await.unwrap();
        assert!(apdu.apci.is_i_frame());

        // Never acknowledged by the first master
        let mut second = raw_client(addr).await;
        start_dt(&mut second).await;
        let apdu = recv(&mut second).await.unwrap();
        let points = crate::parser::parse_asdu(&apdu.asdu.unwrap()).unwrap();
        assert_eq!(points[0].ioa, 7);

        // Acknowledge; the entry leaves the queue
        second.send(Apdu::s_frame(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(station.events().contains(&PeerConnectionEvent::Deactivated));
        assert_eq!(slave.open_connections(), 2);

        slave.stop().await.unwrap();
        assert_eq!(slave.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = SlaveConfig::new("127.0.0.1:0").max_connections(1);
        let (mut slave, addr) = start(config, Arc::default()).await;

        let mut first = raw_client(addr).await;
        start_dt(&mut first).await;

        let mut second = raw_client(addr).await;
        assert!(recv(&mut second).await.is_none());
        assert_eq!(slave.open_connections(), 1);

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected() {
        let config = SlaveConfig::new("127.0.0.1:0")
            .mode(ServerMode::MultipleRedundancyGroups)
            .redundancy_group(RedundancyGroup::new("remote").allow("10.0.0.1".parse().unwrap()));
        let (mut slave, addr) = start(config, Arc::default()).await;

        let mut master = raw_client(addr).await;
        master.send(Apdu::u_frame(UFunction::StartDtAct)).await.ok();
        assert!(recv(&mut master).await.is_none());

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_is_redundancy_group() {
        let config = SlaveConfig::new("127.0.0.1:0").mode(ServerMode::ConnectionIsRedundancyGroup);
        let (mut slave, addr) = start(config, Arc::default()).await;

        let mut first = raw_client(addr).await;
        let mut second = raw_client(addr).await;
        start_dt(&mut first).await;
        start_dt(&mut second).await;

        slave.enqueue_asdu(spontaneous(3)).unwrap();
        assert!(recv(&mut first).await.unwrap().apci.is_i_frame());
        assert!(recv(&mut second).await.unwrap().apci.is_i_frame());

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_connection_acks_without_dispatch() {
        let apci = ApciParameters::default().k(4).w(1);
        let config = SlaveConfig::new("127.0.0.1:0").apci_parameters(apci);
        let (mut slave, addr) = start(config, Arc::default()).await;
        let mut master = raw_client(addr).await;

        let request = Command::Interrogation { qoi: 20 }.to_asdu(Cot::Activation, 1, 0);
        master.send(Apdu::i_frame(0, 0, request)).await.unwrap();

        let reply = recv(&mut master).await.unwrap();
        assert_eq!(reply.apci, Apci::s_frame(1));
        assert!(timeout(Duration::from_millis(300), master.next()).await.is_err());

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reactivated_connection_keeps_unacked_event_queued() {
        let (mut slave, addr) = start(SlaveConfig::new("127.0.0.1:0"), Arc::default()).await;

        let mut a = raw_client(addr).await;
        start_dt(&mut a).await;
        slave.enqueue_asdu(spontaneous(1)).unwrap();
        assert_eq!(recv(&mut a).await.unwrap().apci, Apci::i_frame(0, 0));

        let mut b = raw_client(addr).await;
        start_dt(&mut b).await;
        let apdu = recv(&mut b).await.unwrap();
        assert_eq!(apdu.apci, Apci::i_frame(0, 0));
        assert_eq!(first_ioa(apdu), 1);
        b.send(Apdu::s_frame(1)).await.unwrap();

        slave.enqueue_asdu(spontaneous(2)).unwrap();
        assert_eq!(first_ioa(recv(&mut b).await.unwrap()), 2);

        // A comes back; its first frame after reactivation is N(S)=1
        start_dt(&mut a).await;
        let apdu = recv(&mut a).await.unwrap();
        assert_eq!(apdu.apci, Apci::i_frame(1, 0));
        assert_eq!(first_ioa(apdu), 2);

        // N(R)=1 only covers the frame sent before the failover
        a.send(Apdu::s_frame(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(a);

        start_dt(&mut b).await;
        let apdu = recv(&mut b).await.unwrap();
        assert_eq!(apdu.apci, Apci::i_frame(2, 0));
        assert_eq!(first_ioa(apdu), 2);

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_convenience_senders() {
        let (mut slave, addr) = start(SlaveConfig::new("127.0.0.1:0"), Arc::default()).await;
        let mut master = raw_client(addr).await;
        start_dt(&mut master).await;

        slave
            .send_single_point(Cot::Spontaneous, 1, 10, true, Quality::Good)
            .unwrap();
        slave
            .send_measured_scaled(Cot::Periodic, 1, 20, -42, Quality::Good)
            .unwrap();
        slave
            .send_measured_float(Cot::Spontaneous, 1, 30, 2.5, Quality::Good)
            .unwrap();

        let expected = [
            (TypeId::SinglePoint, Cot::Spontaneous, 10, DataValue::Single(true)),
            (TypeId::MeasuredScaled, Cot::Periodic, 20, DataValue::Scaled(-42)),
            (TypeId::MeasuredFloat, Cot::Spontaneous, 30, DataValue::Float(2.5)),
        ];
        for (type_id, cot, ioa, value) in expected {
            let asdu = recv(&mut master).await.unwrap().asdu.unwrap();
            assert_eq!(asdu.type_id(), type_id);
            assert_eq!(asdu.cot(), cot);
            let points = parse_asdu(&asdu).unwrap();
            assert_eq!(points[0].ioa, ioa);
            assert_eq!(points[0].value, value);
            assert!(points[0].is_good());
        }

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_groups_by_peer_and_catch_all() {
        let config = SlaveConfig::new("127.0.0.1:0")
            .mode(ServerMode::MultipleRedundancyGroups)
            .redundancy_group(RedundancyGroup::new("local").allow("127.0.0.1".parse().unwrap()))
            .redundancy_group(RedundancyGroup::new("others"));
        let (mut slave, addr) = start(config, Arc::default()).await;

        let mut listed = raw_client_from("127.0.0.1", addr).await;
        let mut unlisted = raw_client_from("127.0.0.2", addr).await;
        start_dt(&mut listed).await;
        start_dt(&mut unlisted).await;

        // Different groups: both stay active and both get the event
        slave.enqueue_asdu(spontaneous(5)).unwrap();
        assert_eq!(first_ioa(recv(&mut listed).await.unwrap()), 5);
        assert_eq!(first_ioa(recv(&mut unlisted).await.unwrap()), 5);
        assert_eq!(slave.open_connections(), 2);

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connections_of_one_group_share_queue() {
        let config = SlaveConfig::new("127.0.0.1:0")
            .mode(ServerMode::MultipleRedundancyGroups)
            .redundancy_group(RedundancyGroup::new("main").allow("127.0.0.1".parse().unwrap()))
            .redundancy_group(RedundancyGroup::new("backup").allow("127.0.0.2".parse().unwrap()));
        let (mut slave, addr) = start(config, Arc::default()).await;

        let mut main_a = raw_client_from("127.0.0.1", addr).await;
        let mut main_b = raw_client_from("127.0.0.1", addr).await;
        let mut backup = raw_client_from("127.0.0.2", addr).await;
        start_dt(&mut main_a).await;
        start_dt(&mut backup).await;
        // Activating main_b deactivates main_a
        start_dt(&mut main_b).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        slave.enqueue_asdu(spontaneous(9)).unwrap();
        assert_eq!(first_ioa(recv(&mut main_b).await.unwrap()), 9);
        assert_eq!(first_ioa(recv(&mut backup).await.unwrap()), 9);
        assert!(timeout(Duration::from_millis(300), main_a.next()).await.is_err());

        slave.stop().await.unwrap();
    }
}
