//! Application layer of the controlled station.
//!
//! Both the CS104 slave and the CS101 slave hand received control and system
//! direction ASDUs to [`dispatch`], which calls the matching
//! [`SlaveHandler`] method and produces the mandatory replies.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::error::Result;
use crate::params::AppLayerParameters;
use crate::parser::parse_commands_with;
use crate::types::{Asdu, Command, Cot, Cp16Time2a, Cp56Time2a, TypeId};

/// Sends replies to the master that issued a request.
pub trait Responder: Send + Sync {
    /// Field sizes used on this connection.
    fn app_layer_parameters(&self) -> AppLayerParameters;

    /// Queue an ASDU for transmission to the master.
    fn send_asdu(&self, asdu: Asdu) -> Result<()>;

    /// Send the activation (or deactivation) confirmation of `asdu`.
    fn send_act_con(&self, asdu: &Asdu, negative: bool) -> Result<()> {
        let cot = if asdu.cot() == Cot::Deactivation {
            Cot::DeactivationConfirm
        } else {
            Cot::ActivationConfirm
        };
        self.send_asdu(asdu.mirror(cot, negative))
    }

    /// Send the activation termination of `asdu`.
    fn send_act_term(&self, asdu: &Asdu) -> Result<()> {
        self.send_asdu(asdu.mirror(Cot::ActivationTermination, false))
    }
}

/// Connection lifecycle events reported to [`SlaveHandler::connection_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    /// TCP connection accepted
    Opened,
    /// Connection closed
    Closed,
    /// STARTDT received, the connection is the active one of its group
    Activated,
    /// STOPDT received or another connection of the group was activated
    Deactivated,
}

/// Callbacks of a controlled station.
///
/// Request handlers return `true` when they handled the ASDU. A handler is
/// responsible for its own ACT_CON / ACT_TERM replies except where noted.
/// Everything left unhandled is answered with a negative `UnknownTypeId`
/// mirror after [`SlaveHandler::asdu`] declined it too.
#[allow(unused_variables)]
pub trait SlaveHandler: Send + Sync {
    /// Decide whether a new TCP connection from `peer` is accepted.
    fn accept_connection(&self, peer: SocketAddr) -> bool {
        true
    }

    /// Connection lifecycle notification.
    fn connection_event(&self, peer: SocketAddr, event: PeerConnectionEvent) {}

    /// Station or group interrogation (C_IC_NA_1).
    fn interrogation(&self, responder: &dyn Responder, asdu: &Asdu, qoi: u8) -> bool {
        false
    }

    /// Counter interrogation (C_CI_NA_1).
    fn counter_interrogation(&self, responder: &dyn Responder, asdu: &Asdu, qcc: u8) -> bool {
        false
    }

    /// Read command (C_RD_NA_1) for a single object.
    fn read(&self, responder: &dyn Responder, asdu: &Asdu, ioa: u32) -> bool {
        false
    }

    /// Clock synchronization (C_CS_NA_1).
    ///
    /// The return value selects a positive or negative ACT_CON, which is sent
    /// by the dispatcher.
    fn clock_sync(&self, responder: &dyn Responder, asdu: &Asdu, time: Cp56Time2a) -> bool {
        true
    }

    /// Reset process command (C_RP_NA_1).
    fn reset_process(&self, responder: &dyn Responder, asdu: &Asdu, qrp: u8) -> bool {
        false
    }

    /// Delay acquisition command (C_CD_NA_1).
    fn delay_acquisition(&self, responder: &dyn Responder, asdu: &Asdu, delay: Cp16Time2a) -> bool {
        false
    }

    /// Any other ASDU, including process commands.
    fn asdu(&self, responder: &dyn Responder, asdu: &Asdu) -> bool {
        false
    }
}

/// Handler that accepts every connection and handles nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl SlaveHandler for DefaultHandler {}

fn first_command(asdu: &Asdu, params: &AppLayerParameters) -> Result<Option<(u32, Command)>> {
    Ok(parse_commands_with(asdu, params)?.into_iter().next())
}

fn reject(responder: &dyn Responder, asdu: &Asdu, cot: Cot) -> Result<()> {
    debug!(type_id = %asdu.type_id(), cause = %asdu.cot(), reply = %cot, "rejecting ASDU");
    responder.send_asdu(asdu.mirror(cot, true))
}

/// Route a received ASDU to the handler and send the mandatory replies.
///
/// Control and system commands with a wrong cause of transmission are
/// answered with a negative `UnknownCot` mirror, malformed ones with a
/// negative `UnknownIoa` mirror.
pub fn dispatch(handler: &dyn SlaveHandler, responder: &dyn Responder, asdu: &Asdu) -> Result<()> {
    let cot = asdu.cot();
    let cot_allowed = match asdu.type_id() {
        TypeId::InterrogationCommand | TypeId::CounterInterrogation => {
            Some(matches!(cot, Cot::Activation | Cot::Deactivation))
        }
        TypeId::ReadCommand => Some(cot == Cot::Request),
        TypeId::ClockSync
        | TypeId::TestCommand
        | TypeId::TestCommandTime56
        | TypeId::ResetProcess => Some(cot == Cot::Activation),
        TypeId::DelayAcquisition => Some(matches!(cot, Cot::Activation | Cot::Spontaneous)),
        _ => None,
    };

    let command = match cot_allowed {
        None => None,
        Some(false) => return reject(responder, asdu, Cot::UnknownCot),
        Some(true) => match first_command(asdu, &responder.app_layer_parameters()) {
            Ok(command) => command,
            Err(e) => {
                warn!(type_id = %asdu.type_id(), error = %e, "malformed command");
                return reject(responder, asdu, Cot::UnknownIoa);
            }
        },
    };

    let handled = match command {
        Some((_, Command::Interrogation { qoi })) => handler.interrogation(responder, asdu, qoi),
        Some((_, Command::CounterInterrogation { qcc })) => {
            handler.counter_interrogation(responder, asdu, qcc)
        }
        Some((ioa, Command::Read)) => handler.read(responder, asdu, ioa),
        Some((_, Command::ClockSync { time })) => {
            let accepted = handler.clock_sync(responder, asdu, time);
            responder.send_act_con(asdu, !accepted)?;
            true
        }
        Some((_, Command::Test | Command::TestWithTime { .. })) => {
            responder.send_act_con(asdu, false)?;
            true
        }
        Some((_, Command::ResetProcess { qrp })) => handler.reset_process(responder, asdu, qrp),
        Some((_, Command::DelayAcquisition { delay })) => {
            handler.delay_acquisition(responder, asdu, delay)
        }
        _ => false,
    };

    if handled || handler.asdu(responder, asdu) {
        return Ok(());
    }
    reject(responder, asdu, Cot::UnknownTypeId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Asdu>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<Asdu> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Responder for Recorder {
        fn app_layer_parameters(&self) -> AppLayerParameters {
            AppLayerParameters::cs104()
        }

        fn send_asdu(&self, asdu: Asdu) -> Result<()> {
            self.sent.lock().unwrap().push(asdu);
            Ok(())
        }
    }

    struct Station {
        accept_time: bool,
    }

    impl SlaveHandler for Station {
        fn interrogation(&self, responder: &dyn Responder, asdu: &Asdu, qoi: u8) -> bool {
            assert_eq!(qoi, 20);
            responder.send_act_con(asdu, false).unwrap();
            responder.send_act_term(asdu).unwrap();
            true
        }

        fn clock_sync(&self, _: &dyn Responder, _: &Asdu, _: Cp56Time2a) -> bool {
            self.accept_time
        }
    }

    /// Round trip through the wire format so the ASDU looks received.
    fn received(asdu: Asdu) -> Asdu {
        Asdu::parse(&asdu.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_interrogation_handled() {
        let responder = Recorder::default();
        let handler = Station { accept_time: true };
        let asdu = received(Asdu::interrogation_command(1, 20));

        dispatch(&handler, &responder, &asdu).unwrap();

        let sent = responder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].cot(), Cot::ActivationConfirm);
        assert!(!sent[0].header.negative);
        assert_eq!(sent[1].cot(), Cot::ActivationTermination);
    }

    #[test]
    fn test_interrogation_wrong_cot() {
        let responder = Recorder::default();
        let asdu = received(Command::Interrogation { qoi: 20 }.to_asdu(Cot::Spontaneous, 1, 0));

        dispatch(&DefaultHandler, &responder, &asdu).unwrap();

        let sent = responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].cot(), Cot::UnknownCot);
        assert!(sent[0].header.negative);
    }

    #[test]
    fn test_clock_sync_result() {
        let asdu = received(Asdu::clock_sync_command(1, Cp56Time2a::default()));

        let responder = Recorder::default();
        dispatch(&Station { accept_time: true }, &responder, &asdu).unwrap();
        let sent = responder.sent();
        assert_eq!(sent[0].cot(), Cot::ActivationConfirm);
        assert!(!sent[0].header.negative);

        let responder = Recorder::default();
        dispatch(&Station { accept_time: false }, &responder, &asdu).unwrap();
        assert!(responder.sent()[0].header.negative);
    }

    #[test]
    fn test_test_command_mirrored() {
        let responder = Recorder::default();
        let asdu = received(Command::Test.to_asdu(Cot::Activation, 3, 0));

        dispatch(&DefaultHandler, &responder, &asdu).unwrap();

        let sent = responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].type_id(), TypeId::TestCommand);
        assert_eq!(sent[0].cot(), Cot::ActivationConfirm);
        assert_eq!(sent[0].raw_data, asdu.raw_data);
    }

    #[test]
    fn test_unhandled_command() {
        let responder = Recorder::default();
        let asdu = received(Command::single(true).to_asdu(Cot::Activation, 1, 100));

        dispatch(&DefaultHandler, &responder, &asdu).unwrap();

        let sent = responder.sent();
        assert_eq!(sent[0].cot(), Cot::UnknownTypeId);
        assert!(sent[0].header.negative);
    }

    #[test]
    fn test_deactivation_confirm() {
        let responder = Recorder::default();
        let asdu = received(Command::Interrogation { qoi: 20 }.to_asdu(Cot::Deactivation, 1, 0));
        responder.send_act_con(&asdu, false).unwrap();
        assert_eq!(responder.sent()[0].cot(), Cot::DeactivationConfirm);
    }

    #[test]
    fn test_truncated_command_rejected() {
        let responder = Recorder::default();
        let mut encoded = Asdu::interrogation_command(1, 20).encode().unwrap();
        encoded.truncate(encoded.len() - 1);
        let asdu = Asdu::parse(&encoded).unwrap();

        dispatch(&Station { accept_time: true }, &responder, &asdu).unwrap();

        let sent = responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].type_id(), TypeId::InterrogationCommand);
        assert_eq!(sent[0].cot(), Cot::UnknownIoa);
        assert!(sent[0].header.negative);
    }
}
