//! IEC 60870-5-104 client (controlling station).
//!
//! A [`Connection`] owns a background session task once connected. The task
//! runs the APCI state machine, answers test frames, acknowledges received
//! I-frames and turns received ASDUs into [`ConnectionEvent`]s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::apci::{Apci, UFunction};
use super::codec::{Apdu, ApduCodec};
use super::link::{ApciState, TimerAction};
use crate::error::{Iec60870Error, Result};
use crate::params::{ApciParameters, AppLayerParameters};
use crate::parser::parse_asdu_with;
use crate::types::{
    Asdu, Command, Cot, Cp16Time2a, Cp56Time2a, DataPoint, DoublePointValue, StepCommand, TypeId,
    QCC_GENERAL, QOI_STATION,
};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Resolution of the T1/T2/T3 checks.
const TIMER_TICK: Duration = Duration::from_millis(100);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address (host:port)
    pub address: String,
    /// APCI parameters; `t0` is the connect timeout
    pub apci: ApciParameters,
    /// Application layer parameters
    pub app: AppLayerParameters,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl ConnectionConfig {
    /// Create a new configuration with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            apci: ApciParameters::default(),
            app: AppLayerParameters::cs104(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set connection timeout (T0).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.apci.t0 = timeout;
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

    /// Set the originator address written into sent ASDUs.
    pub fn originator_address(mut self, oa: u8) -> Self {
        self.app.originator_address = oa;
        self
    }

    /// Set the event channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check all parameters.
    pub fn validate(&self) -> Result<()> {
        self.apci.validate()?;
        self.app.validate()?;
        if self.event_capacity == 0 {
            return Err(Iec60870Error::config("event_capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// TCP connected, waiting for STARTDT
    Connected,
    /// Data transfer active (STARTDT confirmed)
    Active,
    /// STOPDT sent, waiting for confirmation
    Stopping,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection established
    Opened,
    /// Connection closed
    Closed,
    /// STARTDT confirmed by the server
    StartDtConfirmed,
    /// STOPDT confirmed by the server
    StopDtConfirmed,
    /// Monitoring data
    DataUpdate {
        /// Common address
        ca: u16,
        /// Cause of transmission
        cot: Cot,
        /// Decoded data points
        points: Vec<DataPoint>,
    },
    /// Activation or deactivation confirmation of a command
    CommandConfirm {
        /// Type of the confirmed command
        type_id: TypeId,
        /// Common address
        ca: u16,
        /// Information object address
        ioa: u32,
        /// Whether the confirmation was positive
        success: bool,
    },
    /// Interrogation terminated
    InterrogationComplete {
        /// Common address
        ca: u16,
    },
    /// ASDU without data points (end of initialization, activation
    /// termination of other commands, ...)
    AsduReceived(Asdu),
    /// Error occurred
    Error(String),
}

enum Request {
    StartDt(oneshot::Sender<Result<()>>),
    StopDt(oneshot::Sender<Result<()>>),
    Send(Asdu, oneshot::Sender<Result<()>>),
    Close,
}

/// IEC 60870-5-104 client connection.
pub struct Connection {
    config: ConnectionConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    unconfirmed: Arc<AtomicUsize>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    requests: Option<mpsc::Sender<Request>>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Create a new, unconnected client.
    pub fn new(config: ConnectionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state: Arc::new(state),
            unconfirmed: Arc::new(AtomicUsize::new(0)),
            event_tx,
            event_rx: Some(event_rx),
            requests: None,
            task: None,
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribe to events.
    ///
    /// This can only be called once. Returns None if already subscribed.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    /// Connect to the configured address within T0.
    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_disconnected()?;
        self.config.validate()?;

        let stream = timeout(self.config.apci.t0, TcpStream::connect(&self.config.address))
            .await
            .map_err(|_| Iec60870Error::ConnectionTimeout)??;
        stream.set_nodelay(true).ok();
        info!(address = %self.config.address, "connected");

        self.connect_with_stream(stream)
    }

    /// Run the session over an already connected stream (for example TLS).
    pub fn connect_with_stream<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.ensure_disconnected()?;
        self.config.validate()?;

        let (request_tx, request_rx) = mpsc::channel(self.config.apci.k as usize + 8);
        self.unconfirmed.store(0, Ordering::Relaxed);
        self.state.send_replace(ConnectionState::Connected);

        let session = Session {
            framed: Framed::new(stream, ApduCodec::new(self.config.app)),
            link: ApciState::new(self.config.apci, Instant::now()),
            app: self.config.app,
            state: self.state.clone(),
            unconfirmed: self.unconfirmed.clone(),
            events: self.event_tx.clone(),
            pending_start: None,
            pending_stop: None,
        };
        self.task = Some(tokio::spawn(session.run(request_rx)));
        self.requests = Some(request_tx);
        Ok(())
    }

    /// Close the connection and wait for the session task to finish.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(requests) = self.requests.take() {
            let _ = requests.send(Request::Close).await;
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Iec60870Error::Internal(format!("session task failed: {}", e)))?;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    /// Start data transfer and wait for STARTDT con (at most T1).
    pub async fn start_dt(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Iec60870Error::protocol("Not connected or already active"));
        }
        self.request(Request::StartDt).await
    }

    /// Stop data transfer and wait for STOPDT con (at most T1).
    pub async fn stop_dt(&self) -> Result<()> {
        if self.state() != ConnectionState::Active {
            return Err(Iec60870Error::protocol("Data transfer not active"));
        }
        self.request(Request::StopDt).await
    }

    /// True while K sent I-frames are waiting for acknowledgment.
    pub fn is_transmit_buffer_full(&self) -> bool {
        self.unconfirmed.load(Ordering::Relaxed) >= self.config.apci.k as usize
    }

    /// Send an ASDU in an I-frame.
    ///
    /// Fails with [`Iec60870Error::TooManyUnconfirmed`] when the send window
    /// is full.
    pub async fn send_asdu(&self, asdu: Asdu) -> Result<()> {
        if self.state() != ConnectionState::Active {
            return Err(Iec60870Error::NotConnected);
        }
        // Reject what the codec could not encode before it reaches the session.
        asdu.encode_with(&mut BytesMut::new(), &self.config.app)?;
        self.request(|reply| Request::Send(asdu, reply)).await
    }

    /// Send station interrogation (QOI 20).
    pub async fn general_interrogation(&self, ca: u16) -> Result<()> {
        self.send_interrogation(Cot::Activation, ca, QOI_STATION).await
    }

    /// Send an interrogation command.
    pub async fn send_interrogation(&self, cot: Cot, ca: u16, qoi: u8) -> Result<()> {
        self.send_command(cot, ca, 0, &Command::Interrogation { qoi })
            .await
    }

    /// Send counter interrogation.
    pub async fn counter_interrogation(&self, ca: u16, qcc: u8) -> Result<()> {
        self.send_command(Cot::Activation, ca, 0, &Command::CounterInterrogation { qcc })
            .await
    }

    /// Send general counter interrogation (QCC 5).
    pub async fn general_counter_interrogation(&self, ca: u16) -> Result<()> {
        self.counter_interrogation(ca, QCC_GENERAL).await
    }

    /// Send read command.
    pub async fn read_command(&self, ca: u16, ioa: u32) -> Result<()> {
        self.send_command(Cot::Request, ca, ioa, &Command::Read).await
    }

    /// Send clock synchronization command.
    pub async fn clock_sync(&self, ca: u16, time: Cp56Time2a) -> Result<()> {
        self.send_command(Cot::Activation, ca, 0, &Command::ClockSync { time })
            .await
    }

    /// Send test command.
    pub async fn test_command(&self, ca: u16) -> Result<()> {
        self.send_command(Cot::Activation, ca, 0, &Command::Test).await
    }

    /// Send test command with time tag.
    pub async fn test_command_with_time(
        &self,
        ca: u16,
        counter: u16,
        time: Cp56Time2a,
    ) -> Result<()> {
        self.send_command(Cot::Activation, ca, 0, &Command::TestWithTime { counter, time })
            .await
    }

    /// Send reset process command.
    pub async fn reset_process(&self, ca: u16, qrp: u8) -> Result<()> {
        self.send_command(Cot::Activation, ca, 0, &Command::ResetProcess { qrp })
            .await
    }

    /// Send delay acquisition command.
    pub async fn delay_acquisition(&self, ca: u16, delay: Cp16Time2a) -> Result<()> {
        self.send_command(Cot::Activation, ca, 0, &Command::DelayAcquisition { delay })
            .await
    }

    /// Send single command.
    pub async fn single_command(&self, ca: u16, ioa: u32, value: bool, select: bool) -> Result<()> {
        let command = Command::Single {
            state: value,
            select,
            qualifier: 0,
            time: None,
        };
        self.send_command(Cot::Activation, ca, ioa, &command).await
    }

    /// Send double command.
    pub async fn double_command(
        &self,
        ca: u16,
        ioa: u32,
        value: DoublePointValue,
        select: bool,
    ) -> Result<()> {
        let command = Command::Double {
            state: value,
            select,
            qualifier: 0,
            time: None,
        };
        self.send_command(Cot::Activation, ca, ioa, &command).await
    }

    /// Send regulating step command.
    pub async fn regulating_step(
        &self,
        ca: u16,
        ioa: u32,
        step: StepCommand,
        select: bool,
    ) -> Result<()> {
        let command = Command::RegulatingStep {
            step,
            select,
            qualifier: 0,
            time: None,
        };
        self.send_command(Cot::Activation, ca, ioa, &command).await
    }

    /// Send setpoint command (normalized value).
    pub async fn setpoint_normalized(&self, ca: u16, ioa: u32, value: f32, select: bool) -> Result<()> {
        let command = Command::SetpointNormalized {
            value,
            select,
            qualifier: 0,
            time: None,
        };
        self.send_command(Cot::Activation, ca, ioa, &command).await
    }

    /// Send setpoint command (scaled value).
    pub async fn setpoint_scaled(&self, ca: u16, ioa: u32, value: i16, select: bool) -> Result<()> {
        let command = Command::SetpointScaled {
            value,
            select,
            qualifier: 0,
            time: None,
        };
        self.send_command(Cot::Activation, ca, ioa, &command).await
    }

    /// Send setpoint command (short floating point).
    pub async fn setpoint_float(&self, ca: u16, ioa: u32, value: f32, select: bool) -> Result<()> {
        let command = Command::SetpointFloat {
            value,
            select,
            qualifier: 0,
            time: None,
        };
        self.send_command(Cot::Activation, ca, ioa, &command).await
    }

    /// Send bitstring of 32 bit command.
    pub async fn bitstring_command(&self, ca: u16, ioa: u32, value: u32) -> Result<()> {
        self.send_command(Cot::Activation, ca, ioa, &Command::Bitstring { value, time: None })
            .await
    }

    /// Send any command as a single-object ASDU.
    pub async fn send_command(&self, cot: Cot, ca: u16, ioa: u32, command: &Command) -> Result<()> {
        self.send_asdu(command.to_asdu(cot, ca, ioa)).await
    }

    // Internal methods

    fn ensure_disconnected(&self) -> Result<()> {
        let running = self.task.as_ref().map_or(false, |t| !t.is_finished());
        if running {
            return Err(Iec60870Error::Connection("Already connected".to_string()));
        }
        Ok(())
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Request,
    {
        let requests = self.requests.as_ref().ok_or(Iec60870Error::NotConnected)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(make(reply_tx))
            .await
            .map_err(|_| Iec60870Error::NotConnected)?;
        reply_rx.await.map_err(|_| Iec60870Error::ChannelClosed)?
    }
}

struct Session<S> {
    framed: Framed<S, ApduCodec>,
    link: ApciState,
    app: AppLayerParameters,
    state: Arc<watch::Sender<ConnectionState>>,
    unconfirmed: Arc<AtomicUsize>,
    events: mpsc::Sender<ConnectionEvent>,
    pending_start: Option<oneshot::Sender<Result<()>>>,
    pending_stop: Option<oneshot::Sender<Result<()>>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        self.emit(ConnectionEvent::Opened);

        let mut ticker = tokio::time::interval(TIMER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(apdu)) => {
                        if let Err(e) = self.handle_apdu(apdu).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(Iec60870Error::Connection("Connection closed by peer".to_string())),
                },
                request = requests.recv() => match request {
                    Some(Request::Close) | None => break Ok(()),
                    Some(request) => {
                        if let Err(e) = self.handle_request(request).await {
                            break Err(e);
                        }
                    }
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

    async fn handle_request(&mut self, request: Request) -> Result<()> {
        let now = Instant::now();
        match request {
            Request::StartDt(reply) => {
                if self.link.pending_activation().is_some() {
                    let _ = reply.send(Err(Iec60870Error::protocol("U-frame activation pending")));
                    return Ok(());
                }
                self.send_u_frame(UFunction::StartDtAct).await?;
                self.pending_start = Some(reply);
            }
            Request::StopDt(reply) => {
                if self.link.pending_activation().is_some() {
                    let _ = reply.send(Err(Iec60870Error::protocol("U-frame activation pending")));
                    return Ok(());
                }
                self.state.send_replace(ConnectionState::Stopping);
                self.send_u_frame(UFunction::StopDtAct).await?;
                self.pending_stop = Some(reply);
            }
            Request::Send(asdu, reply) => {
                if *self.state.borrow() != ConnectionState::Active {
                    let _ = reply.send(Err(Iec60870Error::NotConnected));
                    return Ok(());
                }
                let apci = match self.link.next_i_frame(None, now) {
                    Ok(apci) => apci,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return Ok(());
                    }
                };
                self.sync_window();
                self.framed.send(Apdu { apci, asdu: Some(asdu) }).await?;
                let _ = reply.send(Ok(()));
            }
            Request::Close => {}
        }
        Ok(())
    }

    async fn handle_apdu(&mut self, apdu: Apdu) -> Result<()> {
        let now = Instant::now();
        self.link.on_frame_received(now);

        match apdu.apci {
            Apci::IFrame { send_seq, recv_seq } => {
                let (_, ack_now) = self.link.on_i_frame(send_seq, recv_seq, now)?;
                self.sync_window();
                match apdu.asdu {
                    Some(asdu) => self.process_asdu(asdu),
                    None => debug!(send_seq, "I-frame without decodable ASDU"),
                }
                if ack_now {
                    self.send_s_frame().await?;
                }
            }

            Apci::SFrame { recv_seq } => {
                self.link.on_ack(recv_seq)?;
                self.sync_window();
            }

            Apci::UFrame { function } => match function {
                UFunction::TestFrAct => self.send_u_frame(UFunction::TestFrCon).await?,
                UFunction::TestFrCon => {
                    self.link.on_u_confirm(function);
                }
                UFunction::StartDtCon => {
                    if self.link.on_u_confirm(function) {
                        info!("data transfer started");
                        self.state.send_replace(ConnectionState::Active);
                        self.emit(ConnectionEvent::StartDtConfirmed);
                        if let Some(reply) = self.pending_start.take() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                UFunction::StopDtCon => {
                    if self.link.on_u_confirm(function) {
                        info!("data transfer stopped");
                        self.state.send_replace(ConnectionState::Connected);
                        self.emit(ConnectionEvent::StopDtConfirmed);
                        if let Some(reply) = self.pending_stop.take() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                UFunction::StartDtAct | UFunction::StopDtAct => {
                    debug!(?function, "ignoring activation from controlled station");
                }
            },
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<()> {
        match self.link.poll_timers(Instant::now()) {
            Some(TimerAction::Close) => Err(Iec60870Error::T1Timeout),
            Some(TimerAction::SendSFrame) => self.send_s_frame().await,
            Some(TimerAction::SendTestFrame) => {
                debug!("T3 expired, sending TESTFR act");
                self.send_u_frame(UFunction::TestFrAct).await
            }
            None => Ok(()),
        }
    }

    /// Process received ASDU and convert to the matching event.
    fn process_asdu(&self, asdu: Asdu) {
        let type_id = asdu.type_id();
        let ca = asdu.common_address();
        let cot = asdu.cot();

        let event = match cot {
            Cot::ActivationConfirm | Cot::DeactivationConfirm => {
                let ioa = asdu
                    .information_objects(&self.app)
                    .ok()
                    .and_then(|objects| objects.first().map(|o| o.ioa.value()))
                    .unwrap_or(0);
                ConnectionEvent::CommandConfirm {
                    type_id,
                    ca,
                    ioa,
                    success: !asdu.header.negative,
                }
            }
            Cot::ActivationTermination if type_id == TypeId::InterrogationCommand => {
                ConnectionEvent::InterrogationComplete { ca }
            }
            _ if asdu.header.negative => ConnectionEvent::Error(format!(
                "Negative confirmation for {} (COT={})",
                type_id, cot
            )),
            _ => match parse_asdu_with(&asdu, &self.app) {
                Ok(points) if !points.is_empty() => ConnectionEvent::DataUpdate { ca, cot, points },
                Ok(_) => ConnectionEvent::AsduReceived(asdu),
                Err(e) => {
                    warn!(%type_id, error = %e, "failed to parse ASDU");
                    ConnectionEvent::Error(format!("ASDU parse error: {}", e))
                }
            },
        };
        self.emit(event);
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "event dropped");
        }
    }

    fn sync_window(&self) {
        self.unconfirmed
            .store(self.link.unconfirmed_count(), Ordering::Relaxed);
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

    async fn shutdown(mut self, result: Result<()>) {
        let reason = match &result {
            Ok(()) => {
                info!("connection closed");
                Iec60870Error::NotConnected
            }
            Err(e) => {
                warn!(error = %e, "connection closed");
                self.emit(ConnectionEvent::Error(e.to_string()));
                match e {
                    Iec60870Error::T1Timeout => Iec60870Error::T1Timeout,
                    _ => Iec60870Error::NotConnected,
                }
            }
        };

        let _ = SinkExt::<Apdu>::close(&mut self.framed).await;
        self.link.reset(Instant::now());
        self.sync_window();

        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(clone_reason(&reason)));
        }
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Err(reason));
        }

        self.state.send_replace(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Closed);
    }
}

fn clone_reason(reason: &Iec60870Error) -> Iec60870Error {
    match reason {
        Iec60870Error::T1Timeout => Iec60870Error::T1Timeout,
        _ => Iec60870Error::NotConnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataValue, InformationObject};
    use tokio::net::TcpListener;

    type Server = Framed<TcpStream, ApduCodec>;

    async fn pair(config: ConnectionConfig) -> (Connection, Server) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = Connection::new(ConnectionConfig { address, ..config });
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        client.connect().await.unwrap();
        let stream = accept.await.unwrap();
        (client, Framed::new(stream, ApduCodec::default()))
    }

    async fn start(client: &Connection, server: &mut Server) {
        let (result, _) = tokio::join!(client.start_dt(), async {
            let apdu = server.next().await.unwrap().unwrap();
            assert_eq!(apdu.apci, Apci::u_frame(UFunction::StartDtAct));
            server.send(Apdu::u_frame(UFunction::StartDtCon)).await.unwrap();
        });
        result.unwrap();
    }

    async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_connection_config() {
        let config = ConnectionConfig::new("192.168.1.100:2404")
            .connect_timeout(Duration::from_secs(5))
            .originator_address(3)
            .event_capacity(10);

        assert_eq!(config.address, "192.168.1.100:2404");
        assert_eq!(config.apci.t0, Duration::from_secs(5));
        assert_eq!(config.apci.t1, Duration::from_secs(15));
        assert_eq!(config.app.originator_address, 3);
        assert!(config.validate().is_ok());
        assert!(config.event_capacity(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = Connection::new(ConnectionConfig::new("localhost:2404"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_transmit_buffer_full());
        assert!(matches!(
            client.general_interrogation(1).await,
            Err(Iec60870Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_start_dt_and_interrogation() {
        let (mut client, mut server) = pair(ConnectionConfig::new("")).await;
        let mut events = client.subscribe().unwrap();
        assert!(client.subscribe().is_none());
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Opened));

        start(&client, &mut server).await;
        assert_eq!(client.state(), ConnectionState::Active);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::StartDtConfirmed
        ));

        client.general_interrogation(1).await.unwrap();
        let request = server.next().await.unwrap().unwrap();
        assert_eq!(request.apci, Apci::i_frame(0, 0));
        let request = request.asdu.unwrap();
        assert_eq!(request.type_id(), TypeId::InterrogationCommand);

        let act_con = request.mirror(Cot::ActivationConfirm, false);
        server.send(Apdu::i_frame(0, 1, act_con)).await.unwrap();

        let mut data = Asdu::with_type(TypeId::SinglePoint, Cot::InterrogatedByStation, 1);
        data.push(InformationObject::new(100u32, vec![0x01])).unwrap();
        server.send(Apdu::i_frame(1, 1, data)).await.unwrap();

        let act_term = request.mirror(Cot::ActivationTermination, false);
        server.send(Apdu::i_frame(2, 1, act_term)).await.unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::CommandConfirm {
                type_id,
                ca,
                success,
                ..
            } => {
                assert_eq!(type_id, TypeId::InterrogationCommand);
                assert_eq!(ca, 1);
                assert!(success);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut events).await {
            ConnectionEvent::DataUpdate { ca, cot, points } => {
                assert_eq!(ca, 1);
                assert_eq!(cot, Cot::InterrogatedByStation);
                assert_eq!(points.len(), 1);
                assert_eq!(points[0].ioa, 100);
                assert_eq!(points[0].value, DataValue::Single(true));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::InterrogationComplete { ca: 1 }
        ));

        client.close().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_answers_test_frame() {
        let (mut client, mut server) = pair(ConnectionConfig::new("")).await;

        server.send(Apdu::u_frame(UFunction::TestFrAct)).await.unwrap();
        let reply = timeout(Duration::from_secs(2), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.apci, Apci::u_frame(UFunction::TestFrCon));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_acknowledges_after_w_frames() {
        let apci = ApciParameters::default().k(4).w(2);
        let (mut client, mut server) = pair(ConnectionConfig::new("").apci_parameters(apci)).await;
        start(&client, &mut server).await;

        for seq in 0..2u16 {
            let mut data = Asdu::with_type(TypeId::SinglePoint, Cot::Spontaneous, 1);
            data.push(InformationObject::new(1u32, vec![0x00])).unwrap();
            server.send(Apdu::i_frame(seq, 0, data)).await.unwrap();
        }

        let ack = timeout(Duration::from_secs(2), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ack.apci, Apci::s_frame(2));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_dt_t1_timeout() {
        let apci = ApciParameters::default()
            .t1(Duration::from_millis(300))
            .t2(Duration::from_millis(100));
        let (mut client, mut server) = pair(ConnectionConfig::new("").apci_parameters(apci)).await;
        let mut events = client.subscribe().unwrap();

        let result = client.start_dt().await;
        assert!(matches!(result, Err(Iec60870Error::T1Timeout)));

        // STARTDT act reached the server but was never confirmed
        let apdu = server.next().await.unwrap().unwrap();
        assert_eq!(apdu.apci, Apci::u_frame(UFunction::StartDtAct));

        let mut closed = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(1), events.recv()).await {
            if matches!(event, ConnectionEvent::Closed) {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_dt_while_test_frame_outstanding() {
        let apci = ApciParameters::default().t3(Duration::from_millis(300));
        let (mut client, mut server) = pair(ConnectionConfig::new("").apci_parameters(apci)).await;

        // Leave the keep-alive unanswered
        let test_frame = timeout(Duration::from_secs(2), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(test_frame.apci, Apci::u_frame(UFunction::TestFrAct));

        start(&client, &mut server).await;
        assert_eq!(client.state(), ConnectionState::Active);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_asdu() {
        let (mut client, mut server) = pair(ConnectionConfig::new("")).await;
        start(&client, &mut server).await;

        let mut asdu = Asdu::with_type(TypeId::MeasuredFloat, Cot::Spontaneous, 1);
        for ioa in 0..60u32 {
            asdu.push(InformationObject::new(ioa, vec![0u8; 5])).unwrap();
        }
        assert!(matches!(
            client.send_asdu(asdu).await,
            Err(Iec60870Error::AsduTooLarge { .. })
        ));

        client.close().await.unwrap();
    }
}
