//! IEC 60870-5-101 slave in unbalanced mode (secondary station).
//!
//! The slave only ever answers. Spontaneous and periodic data are queued as
//! class 1 or class 2 user data and handed out when the master polls for
//! them; replies produced by the [`SlaveHandler`] go into class 1.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::frame::{ControlField, Ft12Codec, Ft12Frame, PrimaryFunction, SecondaryFunction};
use crate::error::{Iec60870Error, Result};
use crate::handler::{dispatch, Responder, SlaveHandler};
use crate::params::{AppLayerParameters, LinkLayerParameters};
use crate::types::Asdu;

/// Default capacity of each class queue.
pub const DEFAULT_CLASS_CAPACITY: usize = 100;

/// Slave configuration.
#[derive(Debug, Clone)]
pub struct Cs101SlaveConfig {
    /// Link layer parameters
    pub link: LinkLayerParameters,
    /// Application layer parameters
    pub app: AppLayerParameters,
    /// Own link address
    pub address: u16,
    /// Capacity of the class 1 queue
    pub class1_capacity: usize,
    /// Capacity of the class 2 queue
    pub class2_capacity: usize,
}

impl Cs101SlaveConfig {
    /// Create a configuration for link address `address`.
    pub fn new(address: u16) -> Self {
        Self {
            link: LinkLayerParameters::default(),
            app: AppLayerParameters::cs101(),
            address,
            class1_capacity: DEFAULT_CLASS_CAPACITY,
            class2_capacity: DEFAULT_CLASS_CAPACITY,
        }
    }

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

    /// Set both queue capacities.
    pub fn queue_capacity(mut self, class1: usize, class2: usize) -> Self {
        self.class1_capacity = class1;
        self.class2_capacity = class2;
        self
    }

    /// Check all parameters.
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.app.validate()?;
        let broadcast = self.link.broadcast_address();
        if self.link.address_length > 0 && self.address >= broadcast {
            return Err(Iec60870Error::config(format!(
                "link address {} out of range",
                self.address
            )));
        }
        if self.class1_capacity == 0 || self.class2_capacity == 0 {
            return Err(Iec60870Error::config("queue capacity must be non-zero"));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct ClassQueue {
    name: &'static str,
    entries: Mutex<VecDeque<Asdu>>,
    capacity: usize,
}

impl ClassQueue {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn push(&self, asdu: Asdu) {
        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity {
            warn!(queue = self.name, "queue full, dropping oldest ASDU");
            entries.pop_front();
        }
        entries.push_back(asdu);
    }

    fn pop(&self) -> Option<Asdu> {
        lock(&self.entries).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Puts handler replies into the class 1 queue.
struct ClassResponder<'a> {
    app: AppLayerParameters,
    class1: &'a ClassQueue,
}

impl Responder for ClassResponder<'_> {
    fn app_layer_parameters(&self) -> AppLayerParameters {
        self.app
    }

    fn send_asdu(&self, asdu: Asdu) -> Result<()> {
        asdu.encode_with(&mut BytesMut::new(), &self.app)?;
        self.class1.push(asdu);
        Ok(())
    }
}

/// Duplicate detection state of the secondary link.
#[derive(Debug, Default)]
struct SecondaryLink {
    /// FCB of the last accepted FCV=1 frame
    last_fcb: Option<bool>,
    last_response: Option<Ft12Frame>,
}

/// IEC 60870-5-101 slave (unbalanced mode).
pub struct Cs101Slave {
    config: Cs101SlaveConfig,
    handler: Arc<dyn SlaveHandler>,
    class1: ClassQueue,
    class2: ClassQueue,
}

impl Cs101Slave {
    /// Create a slave. Call [`Cs101Slave::run`] to serve a transport.
    pub fn new(config: Cs101SlaveConfig, handler: Arc<dyn SlaveHandler>) -> Self {
        let class1 = ClassQueue::new("class1", config.class1_capacity);
        let class2 = ClassQueue::new("class2", config.class2_capacity);
        Self {
            config,
            handler,
            class1,
            class2,
        }
    }

    /// Get configuration.
    pub fn config(&self) -> &Cs101SlaveConfig {
        &self.config
    }

    /// Queue high priority (class 1) data, e.g. spontaneous events.
    pub fn enqueue_class1(&self, asdu: Asdu) -> Result<()> {
        self.check(&asdu)?;
        self.class1.push(asdu);
        Ok(())
    }

    /// Queue low priority (class 2) data, e.g. cyclic measurements.
    pub fn enqueue_class2(&self, asdu: Asdu) -> Result<()> {
        self.check(&asdu)?;
        self.class2.push(asdu);
        Ok(())
    }

    /// Number of queued class 1 and class 2 ASDUs.
    pub fn queued(&self) -> (usize, usize) {
        (self.class1.len(), self.class2.len())
    }

    fn check(&self, asdu: &Asdu) -> Result<()> {
        asdu.encode_with(&mut BytesMut::new(), &self.config.app)
    }

    /// Serve requests from the master until the transport is closed.
    pub async fn run<T>(&self, transport: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.config.validate()?;
        let mut framed = Framed::new(transport, Ft12Codec::new(self.config.link.address_length));
        let mut link = SecondaryLink::default();
        info!(address = self.config.address, "slave serving link");

        while let Some(frame) = framed.next().await {
            if let Some(response) = self.handle_frame(&mut link, frame?) {
                framed.send(response).await?;
            }
        }

        info!(address = self.config.address, "link closed");
        Ok(())
    }

    fn handle_frame(&self, link: &mut SecondaryLink, frame: Ft12Frame) -> Option<Ft12Frame> {
        let (control, address) = match &frame {
            Ft12Frame::SingleChar => return None,
            Ft12Frame::Fixed { control, address } | Ft12Frame::Variable { control, address, .. } => {
                (*control, *address)
            }
        };
        if !control.is_primary() {
            return None;
        }

        let broadcast = self.config.link.address_length > 0
            && address == self.config.link.broadcast_address();
        if address != self.config.address && !broadcast {
            return None;
        }

        let function = match control.primary_function() {
            Ok(function) => function,
            Err(e) => {
                debug!(error = %e, "unsupported link service");
                return (!broadcast).then(|| self.fixed(SecondaryFunction::LinkServiceNotImplemented));
            }
        };

        if broadcast {
            if function == PrimaryFunction::UserDataNoReply {
                self.deliver(&frame);
            }
            return None;
        }

        if control.fcv() {
            if link.last_fcb == Some(control.fcb()) {
                debug!(?function, "repeated frame, sending last response");
                return link.last_response.clone();
            }
            link.last_fcb = Some(control.fcb());
        }

        let response = match function {
            PrimaryFunction::RequestLinkStatus | PrimaryFunction::RequestAccessDemand => {
                Some(self.fixed(SecondaryFunction::StatusOfLink))
            }
            PrimaryFunction::ResetRemoteLink => {
                link.last_fcb = Some(false);
                link.last_response = None;
                Some(self.ack())
            }
            PrimaryFunction::ResetUserProcess => {
                self.class1.clear();
                self.class2.clear();
                Some(self.ack())
            }
            PrimaryFunction::TestFunctionLink => Some(self.ack()),
            PrimaryFunction::UserDataConfirmed => {
                if self.deliver(&frame) {
                    Some(self.ack())
                } else {
                    Some(self.fixed(SecondaryFunction::Nack))
                }
            }
            PrimaryFunction::UserDataNoReply => {
                self.deliver(&frame);
                None
            }
            PrimaryFunction::RequestClass1 => Some(self.user_data(&self.class1)),
            PrimaryFunction::RequestClass2 => Some(self.user_data(&self.class2)),
        };

        if control.fcv() {
            link.last_response = response.clone();
        }
        response
    }

    /// Hand the ASDU of a user data frame to the handler.
    fn deliver(&self, frame: &Ft12Frame) -> bool {
        let Ft12Frame::Variable { asdu, .. } = frame else {
            warn!("user data frame without ASDU");
            return false;
        };
        let asdu = match Asdu::parse_with(asdu, &self.config.app) {
            Ok(asdu) => asdu,
            Err(e) => {
                warn!(error = %e, "invalid ASDU from master");
                return false;
            }
        };
        let responder = ClassResponder {
            app: self.config.app,
            class1: &self.class1,
        };
        if let Err(e) = dispatch(self.handler.as_ref(), &responder, &asdu) {
            warn!(error = %e, "failed to handle ASDU");
        }
        true
    }

    fn user_data(&self, queue: &ClassQueue) -> Ft12Frame {
        if let Some(asdu) = queue.pop() {
            let mut buf = BytesMut::new();
            match asdu.encode_with(&mut buf, &self.config.app) {
                Ok(()) => {
                    return Ft12Frame::Variable {
                        control: ControlField::secondary(
                            SecondaryFunction::RespUserData,
                            self.acd(),
                            false,
                        ),
                        address: self.config.address,
                        asdu: buf.freeze(),
                    }
                }
                Err(e) => warn!(error = %e, "dropping unencodable ASDU"),
            }
        }
        self.single_or_fixed(SecondaryFunction::RespNackNoData)
    }

    fn acd(&self) -> bool {
        self.class1.len() > 0
    }

    fn ack(&self) -> Ft12Frame {
        self.single_or_fixed(SecondaryFunction::Ack)
    }

    fn single_or_fixed(&self, function: SecondaryFunction) -> Ft12Frame {
        if self.config.link.use_single_char_ack && !self.acd() {
            Ft12Frame::SingleChar
        } else {
            self.fixed(function)
        }
    }

    fn fixed(&self, function: SecondaryFunction) -> Ft12Frame {
        Ft12Frame::Fixed {
            control: ControlField::secondary(function, self.acd(), false),
            address: self.config.address,
        }
    }
}
