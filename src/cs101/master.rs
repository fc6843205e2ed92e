//! IEC 60870-5-101 master in unbalanced mode (primary station).
//!
//! The master owns the serial line. It polls every configured slave in turn:
//! the link is set up with request-status / reset, then user data queued by
//! the application is sent with "user data confirmed", and otherwise class 1
//! (when the slave signalled ACD) or class 2 data is requested.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::frame::{ControlField, Ft12Codec, Ft12Frame, PrimaryFunction, SecondaryFunction};
use crate::error::{Iec60870Error, Result};
use crate::params::{AppLayerParameters, LinkLayerParameters};
use crate::types::{Asdu, Command, Cot, Cp56Time2a};

/// Default time between polling cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State of the link to one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link not yet established
    Idle,
    /// Slave does not answer
    Error,
    /// Slave signalled data flow control (DFC=1)
    Busy,
    /// Link established
    Available,
}

/// Events emitted by the master.
#[derive(Debug, Clone)]
pub enum MasterEvent {
    /// Link state of a slave changed
    LinkStateChanged {
        /// Link address of the slave
        address: u16,
        /// New state
        state: LinkState,
    },
    /// ASDU received from a slave
    AsduReceived {
        /// Link address of the slave
        address: u16,
        /// Received ASDU
        asdu: Asdu,
    },
    /// Error occurred
    Error(String),
}

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Link layer parameters
    pub link: LinkLayerParameters,
    /// Application layer parameters
    pub app: AppLayerParameters,
    /// Pause after each polling cycle
    pub poll_interval: Duration,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl MasterConfig {
    /// Set link layer parameters.
    pub fn link_layer_parameters(mut self, params: LinkLayerParameters) -> Self {
        self.link = params;
        self
    }

    /// Set application layer parameters.
    pub fn app_layer_parameters(mut self, params: AppLayerParameters) -> Self {
        self.app = params;
        self
    }

    /// Set the polling interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Check all parameters.
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.app.validate()?;
        if self.poll_interval.is_zero() {
            return Err(Iec60870Error::config("poll_interval must be non-zero"));
        }
        Ok(())
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            link: LinkLayerParameters::default(),
            app: AppLayerParameters::cs101(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_capacity: 100,
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setup {
    RequestStatus,
    ResetLink,
    Done,
}

/// Outcome of one request/response exchange with a slave.
#[derive(Debug)]
enum Outcome {
    None,
    Asdu(Asdu, Option<LinkState>),
    StateChanged(LinkState),
}

/// Primary link state machine of one slave.
struct PrimaryLink {
    address: u16,
    state: LinkState,
    setup: Setup,
    /// FCB of the next FCV=1 frame
    fcb: bool,
    acd: bool,
    user_data: VecDeque<(Asdu, Reply)>,
}

impl PrimaryLink {
    fn new(address: u16) -> Self {
        Self {
            address,
            state: LinkState::Idle,
            setup: Setup::RequestStatus,
            fcb: false,
            acd: false,
            user_data: VecDeque::new(),
        }
    }

    fn fixed(&self, function: PrimaryFunction) -> Ft12Frame {
        Ft12Frame::Fixed {
            control: ControlField::primary(function, self.fcb),
            address: self.address,
        }
    }

    /// Next request frame and its function.
    fn next_request(&self, app: &AppLayerParameters) -> (PrimaryFunction, Ft12Frame) {
        let function = match self.setup {
            Setup::RequestStatus => PrimaryFunction::RequestLinkStatus,
            Setup::ResetLink => PrimaryFunction::ResetRemoteLink,
            Setup::Done => {
                if self.state != LinkState::Busy {
                    if let Some((asdu, _)) = self.user_data.front() {
                        let mut buf = BytesMut::new();
                        if asdu.encode_with(&mut buf, app).is_ok() {
                            let frame = Ft12Frame::Variable {
                                control: ControlField::primary(
                                    PrimaryFunction::UserDataConfirmed,
                                    self.fcb,
                                ),
                                address: self.address,
                                asdu: buf.freeze(),
                            };
                            return (PrimaryFunction::UserDataConfirmed, frame);
                        }
                    }
                }
                if self.acd {
                    PrimaryFunction::RequestClass1
                } else {
                    PrimaryFunction::RequestClass2
                }
            }
        };
        (function, self.fixed(function))
    }

    fn set_state(&mut self, state: LinkState) -> Outcome {
        if self.state == state {
            return Outcome::None;
        }
        info!(address = self.address, ?state, "link state changed");
        self.state = state;
        Outcome::StateChanged(state)
    }

    /// Process the response to `function`.
    fn on_response(
        &mut self,
        function: PrimaryFunction,
        frame: Ft12Frame,
        app: &AppLayerParameters,
    ) -> Result<Outcome> {
        // A single character stands for ACK or NACK without data, ACD=0
        let (secondary, control) = match &frame {
            Ft12Frame::SingleChar => {
                let secondary = if function == PrimaryFunction::UserDataConfirmed
                    || function == PrimaryFunction::ResetRemoteLink
                {
                    SecondaryFunction::Ack
                } else {
                    SecondaryFunction::RespNackNoData
                };
                (secondary, ControlField::secondary(secondary, false, false))
            }
            Ft12Frame::Fixed { control, .. } | Ft12Frame::Variable { control, .. } => {
                (control.secondary_function()?, *control)
            }
        };

        if function.uses_fcb() {
            self.fcb = !self.fcb;
        }
        self.acd = control.acd();

        match (function, secondary) {
            (PrimaryFunction::RequestLinkStatus, SecondaryFunction::StatusOfLink) => {
                self.setup = Setup::ResetLink;
                Ok(Outcome::None)
            }
            (PrimaryFunction::ResetRemoteLink, SecondaryFunction::Ack) => {
                self.setup = Setup::Done;
                self.fcb = true;
                Ok(self.set_state(LinkState::Available))
            }
            (PrimaryFunction::UserDataConfirmed, SecondaryFunction::Ack) => {
                if let Some((_, reply)) = self.user_data.pop_front() {
                    let _ = reply.send(Ok(()));
                }
                Ok(self.flow_control(control))
            }
            (PrimaryFunction::UserDataConfirmed, SecondaryFunction::Nack) => {
                if let Some((_, reply)) = self.user_data.pop_front() {
                    let _ = reply.send(Err(Iec60870Error::link_layer("user data not accepted")));
                }
                Ok(self.flow_control(control))
            }
            (
                PrimaryFunction::RequestClass1 | PrimaryFunction::RequestClass2,
                SecondaryFunction::RespUserData,
            ) => {
                let changed = match self.flow_control(control) {
                    Outcome::StateChanged(state) => Some(state),
                    _ => None,
                };
                match frame {
                    Ft12Frame::Variable { asdu, .. } => {
                        Ok(Outcome::Asdu(Asdu::parse_with(&asdu, app)?, changed))
                    }
                    _ => Err(Iec60870Error::link_layer("user data response without ASDU")),
                }
            }
            (
                PrimaryFunction::RequestClass1 | PrimaryFunction::RequestClass2,
                SecondaryFunction::RespNackNoData,
            ) => Ok(self.flow_control(control)),
            (function, secondary) => {
                debug!(address = self.address, ?function, ?secondary, "unexpected response");
                Ok(Outcome::None)
            }
        }
    }

    fn flow_control(&mut self, control: ControlField) -> Outcome {
        if control.dfc() {
            self.set_state(LinkState::Busy)
        } else {
            self.set_state(LinkState::Available)
        }
    }

    /// No response after all repetitions.
    fn on_timeout(&mut self) -> Outcome {
        warn!(address = self.address, "no response from slave");
        self.setup = Setup::RequestStatus;
        self.acd = false;
        self.fail_pending("link to slave failed");
        self.set_state(LinkState::Error)
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, reply) in self.user_data.drain(..) {
            let _ = reply.send(Err(Iec60870Error::link_layer(reason)));
        }
    }
}

enum Request {
    AddSlave(u16),
    RemoveSlave(u16),
    Send(u16, Asdu, Reply),
    Stop,
}

/// IEC 60870-5-101 master (unbalanced mode).
pub struct Cs101Master {
    config: MasterConfig,
    requests: mpsc::Sender<Request>,
    states: Arc<Mutex<HashMap<u16, LinkState>>>,
    event_rx: Option<mpsc::Receiver<MasterEvent>>,
    task: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Cs101Master {
    /// Start the polling task on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T>(transport: T, config: MasterConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let (request_tx, request_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let states = Arc::new(Mutex::new(HashMap::new()));

        let poller = Poller {
            framed: Framed::new(transport, Ft12Codec::new(config.link.address_length)),
            config: config.clone(),
            slaves: Vec::new(),
            states: states.clone(),
            events: event_tx,
        };
        let task = tokio::spawn(poller.run(request_rx));

        Ok(Self {
            config,
            requests: request_tx,
            states,
            event_rx: Some(event_rx),
            task: Some(task),
        })
    }

    /// Subscribe to events.
    ///
    /// This can only be called once. Returns None if already subscribed.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<MasterEvent>> {
        self.event_rx.take()
    }

    /// Add a slave to the polling cycle.
    pub async fn add_slave(&self, address: u16) -> Result<()> {
        let broadcast = self.config.link.broadcast_address();
        if self.config.link.address_length > 0 && address >= broadcast {
            return Err(Iec60870Error::config(format!("invalid slave address {}", address)));
        }
        lock(&self.states).entry(address).or_insert(LinkState::Idle);
        self.request(Request::AddSlave(address)).await
    }

    /// Remove a slave from the polling cycle.
    pub async fn remove_slave(&self, address: u16) -> Result<()> {
        lock(&self.states).remove(&address);
        self.request(Request::RemoveSlave(address)).await
    }

    /// Link state of a slave, `None` if unknown.
    pub fn link_state(&self, address: u16) -> Option<LinkState> {
        lock(&self.states).get(&address).copied()
    }

    /// Send an ASDU with "user data confirmed". Resolves when the slave
    /// acknowledged it.
    pub async fn send_asdu(&self, address: u16, asdu: Asdu) -> Result<()> {
        let mut buf = BytesMut::new();
        asdu.encode_with(&mut buf, &self.config.app)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Request::Send(address, asdu, reply_tx)).await?;
        reply_rx.await.map_err(|_| Iec60870Error::ChannelClosed)?
    }

    /// Send an interrogation command.
    pub async fn send_interrogation(&self, address: u16, ca: u16, qoi: u8) -> Result<()> {
        self.send_command(address, Cot::Activation, ca, 0, &Command::Interrogation { qoi })
            .await
    }

    /// Send a counter interrogation command.
    pub async fn send_counter_interrogation(&self, address: u16, ca: u16, qcc: u8) -> Result<()> {
        self.send_command(address, Cot::Activation, ca, 0, &Command::CounterInterrogation { qcc })
            .await
    }

    /// Send a clock synchronization command.
    pub async fn send_clock_sync(&self, address: u16, ca: u16, time: Cp56Time2a) -> Result<()> {
        self.send_command(address, Cot::Activation, ca, 0, &Command::ClockSync { time })
            .await
    }

    /// Send any command as a single-object ASDU.
    pub async fn send_command(
        &self,
        address: u16,
        cot: Cot,
        ca: u16,
        ioa: u32,
        command: &Command,
    ) -> Result<()> {
        self.send_asdu(address, command.to_asdu(cot, ca, ioa)).await
    }

    /// Stop polling and wait for the task to finish.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.requests.send(Request::Stop).await;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Iec60870Error::Internal(format!("master task failed: {}", e)))?;
        }
        Ok(())
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| Iec60870Error::ChannelClosed)
    }
}

struct Poller<T> {
    framed: Framed<T, Ft12Codec>,
    config: MasterConfig,
    slaves: Vec<PrimaryLink>,
    states: Arc<Mutex<HashMap<u16, LinkState>>>,
    events: mpsc::Sender<MasterEvent>,
}

impl<T> Poller<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next = 0usize;

        loop {
            // Pending requests first
            loop {
                match requests.try_recv() {
                    Ok(request) => {
                        if !self.handle_request(request) {
                            return self.shutdown();
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return self.shutdown(),
                }
            }

            if next >= self.slaves.len() {
                next = 0;
                tokio::select! {
                    _ = ticker.tick() => {}
                    request = requests.recv() => match request {
                        Some(request) => {
                            if !self.handle_request(request) {
                                return self.shutdown();
                            }
                        }
                        None => return self.shutdown(),
                    },
                }
                continue;
            }

            if let Err(e) = self.poll_slave(next).await {
                warn!(error = %e, "serial transport failed");
                self.emit(MasterEvent::Error(e.to_string()));
                let mut changed = Vec::new();
                for slave in &mut self.slaves {
                    slave.fail_pending("transport closed");
                    if let Outcome::StateChanged(state) = slave.set_state(LinkState::Error) {
                        changed.push((slave.address, state));
                    }
                }
                for (address, state) in changed {
                    self.state_changed(address, state);
                }
                return;
            }
            next += 1;
        }
    }

    /// Returns `false` on stop.
    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::AddSlave(address) => {
                if !self.slaves.iter().any(|s| s.address == address) {
                    debug!(address, "slave added");
                    self.slaves.push(PrimaryLink::new(address));
                }
            }
            Request::RemoveSlave(address) => {
                self.slaves.retain_mut(|s| {
                    if s.address == address {
                        s.fail_pending("slave removed");
                        false
                    } else {
                        true
                    }
                });
            }
            Request::Send(address, asdu, reply) => {
                match self.slaves.iter_mut().find(|s| s.address == address) {
                    Some(slave) if slave.state != LinkState::Error => {
                        slave.user_data.push_back((asdu, reply))
                    }
                    Some(_) => {
                        let _ = reply.send(Err(Iec60870Error::link_layer("link to slave failed")));
                    }
                    None => {
                        let _ = reply.send(Err(Iec60870Error::config(format!(
                            "unknown slave {}",
                            address
                        ))));
                    }
                }
            }
            Request::Stop => return false,
        }
        true
    }

    async fn poll_slave(&mut self, index: usize) -> Result<()> {
        let (function, frame) = self.slaves[index].next_request(&self.config.app);
        let address = self.slaves[index].address;

        let outcome = match self.transact(address, frame).await? {
            Some(response) => {
                match self.slaves[index].on_response(function, response, &self.config.app) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(address, error = %e, "invalid response");
                        self.emit(MasterEvent::Error(e.to_string()));
                        Outcome::None
                    }
                }
            }
            None => self.slaves[index].on_timeout(),
        };

        match outcome {
            Outcome::None => {}
            Outcome::Asdu(asdu, changed) => {
                if let Some(state) = changed {
                    self.state_changed(address, state);
                }
                self.emit(MasterEvent::AsduReceived { address, asdu });
            }
            Outcome::StateChanged(state) => self.state_changed(address, state),
        }
        Ok(())
    }

    /// Send `frame` and wait for the answer, repeating it until
    /// `timeout_repeat` has elapsed. `Ok(None)` means no answer.
    async fn transact(&mut self, address: u16, frame: Ft12Frame) -> Result<Option<Ft12Frame>> {
        let started = Instant::now();
        let params = self.config.link;
        loop {
            self.framed.send(frame.clone()).await?;
            match timeout(params.timeout_for_ack, self.next_response(address)).await {
                Ok(response) => return response.map(Some),
                Err(_) => {
                    if started.elapsed() >= params.timeout_repeat {
                        return Ok(None);
                    }
                    debug!(address, "no response, repeating request");
                }
            }
        }
    }

    async fn next_response(&mut self, address: u16) -> Result<Ft12Frame> {
        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or_else(|| Iec60870Error::Connection("serial transport closed".to_string()))??;
            let from_slave = match &frame {
                Ft12Frame::SingleChar => true,
                Ft12Frame::Fixed { control, .. } | Ft12Frame::Variable { control, .. } => {
                    !control.is_primary() && frame.address() == Some(address)
                }
            };
            if from_slave {
                return Ok(frame);
            }
            debug!(?frame, "ignoring frame");
        }
    }

    fn state_changed(&self, address: u16, state: LinkState) {
        if let Some(entry) = lock(&self.states).get_mut(&address) {
            *entry = state;
        }
        self.emit(MasterEvent::LinkStateChanged { address, state });
    }

    fn emit(&self, event: MasterEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "event dropped");
        }
    }

    fn shutdown(&mut self) {
        for slave in &mut self.slaves {
            slave.fail_pending("master stopped");
        }
        info!("master stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs101::{Cs101Slave, Cs101SlaveConfig};
    use crate::handler::{Responder, SlaveHandler};
    use crate::parser::parse_asdu_with;
    use crate::types::{DataPoint, DataValue, TypeId};
    use tokio::io::{duplex, DuplexStream};

    struct Station;

    impl SlaveHandler for Station {
        fn interrogation(&self, responder: &dyn Responder, asdu: &Asdu, _qoi: u8) -> bool {
            responder.send_act_con(asdu, false).unwrap();
            responder.send_act_term(asdu).unwrap();
            true
        }
    }

    fn fast_config() -> MasterConfig {
        MasterConfig::default()
            .poll_interval(Duration::from_millis(10))
            .link_layer_parameters(
                LinkLayerParameters::default()
                    .timeout_for_ack(Duration::from_millis(50))
                    .timeout_repeat(Duration::from_millis(150)),
            )
    }

    async fn next_asdu(events: &mut mpsc::Receiver<MasterEvent>) -> Asdu {
        loop {
            match timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(MasterEvent::AsduReceived { asdu, .. })) => return asdu,
                Ok(Some(_)) => {}
                other => panic!("no ASDU received: {:?}", other),
            }
        }
    }

    #[test]
    fn test_primary_link_setup_sequence() {
        let app = AppLayerParameters::cs101();
        let mut link = PrimaryLink::new(1);

        let (function, _) = link.next_request(&app);
        assert_eq!(function, PrimaryFunction::RequestLinkStatus);
        let status = Ft12Frame::Fixed {
            control: ControlField::secondary(SecondaryFunction::StatusOfLink, false, false),
            address: 1,
        };
        link.on_response(function, status, &app).unwrap();

        let (function, _) = link.next_request(&app);
        assert_eq!(function, PrimaryFunction::ResetRemoteLink);
        let outcome = link.on_response(function, Ft12Frame::SingleChar, &app).unwrap();
        assert!(matches!(outcome, Outcome::StateChanged(LinkState::Available)));

        // First FCV=1 frame carries FCB=1, then it alternates
        let (function, frame) = link.next_request(&app);
        assert_eq!(function, PrimaryFunction::RequestClass2);
        assert!(frame.control().unwrap().fcb());
        link.on_response(function, Ft12Frame::SingleChar, &app).unwrap();
        let (_, frame) = link.next_request(&app);
        assert!(!frame.control().unwrap().fcb());
    }

    #[test]
    fn test_acd_selects_class1() {
        let app = AppLayerParameters::cs101();
        let mut link = PrimaryLink::new(1);
        link.setup = Setup::Done;
        link.state = LinkState::Available;

        let nack = Ft12Frame::Fixed {
            control: ControlField::secondary(SecondaryFunction::RespNackNoData, true, false),
            address: 1,
        };
        link.on_response(PrimaryFunction::RequestClass2, nack, &app).unwrap();
        assert_eq!(link.next_request(&app).0, PrimaryFunction::RequestClass1);

        let busy = Ft12Frame::Fixed {
            control: ControlField::secondary(SecondaryFunction::RespNackNoData, false, true),
            address: 1,
        };
        let outcome = link.on_response(PrimaryFunction::RequestClass1, busy, &app).unwrap();
        assert!(matches!(outcome, Outcome::StateChanged(LinkState::Busy)));
    }

    #[test]
    fn test_timeout_fails_pending_user_data() {
        let mut link = PrimaryLink::new(1);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        link.user_data
            .push_back((Asdu::interrogation_command(1, 20), reply_tx));
        assert!(matches!(link.on_timeout(), Outcome::StateChanged(LinkState::Error)));
        assert!(matches!(reply_rx.try_recv(), Ok(Err(_))));
        assert_eq!(link.setup, Setup::RequestStatus);
    }

    fn spawn_slave(stream: DuplexStream) -> Arc<Cs101Slave> {
        let config = Cs101SlaveConfig::new(1);
        let slave = Arc::new(Cs101Slave::new(config, Arc::new(Station)));
        let runner = slave.clone();
        tokio::spawn(async move { runner.run(stream).await });
        slave
    }

    #[tokio::test]
    async fn test_master_polls_slave_data() {
        let (master_io, slave_io) = duplex(1024);
        let slave = spawn_slave(slave_io);
        let mut master = Cs101Master::start(master_io, fast_config()).unwrap();
        let mut events = master.subscribe().unwrap();

        master.add_slave(1).await.unwrap();
        let asdu = Asdu::from_points(
            TypeId::MeasuredFloat,
            Cot::Spontaneous,
            1,
            false,
            &[DataPoint::new(200, DataValue::Float(1.5))],
        )
        .unwrap();
        slave.enqueue_class1(asdu).unwrap();

        let received = next_asdu(&mut events).await;
        let points = parse_asdu_with(&received, &AppLayerParameters::cs101()).unwrap();
        assert_eq!(points[0].ioa, 200);
        assert_eq!(points[0].value, DataValue::Float(1.5));
        assert_eq!(master.link_state(1), Some(LinkState::Available));

        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrogation_round_trip() {
        let (master_io, slave_io) = duplex(1024);
        let _slave = spawn_slave(slave_io);
        let mut master = Cs101Master::start(master_io, fast_config()).unwrap();
        let mut events = master.subscribe().unwrap();

        master.add_slave(1).await.unwrap();
        timeout(Duration::from_secs(2), master.send_interrogation(1, 1, 20))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(next_asdu(&mut events).await.cot(), Cot::ActivationConfirm);
        assert_eq!(next_asdu(&mut events).await.cot(), Cot::ActivationTermination);

        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_loss_reports_link_error() {
        let (master_io, slave_io) = duplex(1024);
        let slave = Arc::new(Cs101Slave::new(Cs101SlaveConfig::new(1), Arc::new(Station)));
        let runner = slave.clone();
        let slave_task = tokio::spawn(async move { runner.run(slave_io).await });

        let mut master = Cs101Master::start(master_io, fast_config()).unwrap();
        let mut events = master.subscribe().unwrap();
        master.add_slave(1).await.unwrap();

        let mut seen = Vec::new();
        while !seen.contains(&LinkState::Error) {
            match timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(MasterEvent::LinkStateChanged { address: 1, state })) => {
                    if state == LinkState::Available {
                        // Serial line goes away
                        slave_task.abort();
                    }
                    seen.push(state);
                }
                Ok(Some(_)) => {}
                other => panic!("no link error reported: {:?}", other),
            }
        }
        assert_eq!(seen, vec![LinkState::Available, LinkState::Error]);
        assert_eq!(master.link_state(1), Some(LinkState::Error));

        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_slave_goes_to_error() {
        let (master_io, _silent) = duplex(1024);
        let mut master = Cs101Master::start(master_io, fast_config()).unwrap();
        let mut events = master.subscribe().unwrap();
        master.add_slave(5).await.unwrap();
        assert_eq!(master.link_state(5), Some(LinkState::Idle));

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert!(matches!(
            event,
            Some(MasterEvent::LinkStateChanged {
                address: 5,
                state: LinkState::Error
            })
        ));
        assert_eq!(master.link_state(5), Some(LinkState::Error));
        assert!(master.send_asdu(9, Asdu::interrogation_command(1, 20)).await.is_err());

        master.stop().await.unwrap();
    }
}
