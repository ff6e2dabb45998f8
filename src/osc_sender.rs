use crate::types::*;
use crossbeam_channel::Receiver;
use log::{debug, error, info};
use rosc::{OscMessage, OscPacket, OscType};
use std::net::UdpSocket;

/// Forwards run progress as OSC messages for external displays.
pub struct OscSender {
    rx: Receiver<RunEvent>,
    target: String,
}

impl OscSender {
    pub fn new(rx: Receiver<RunEvent>, target: String) -> Self {
        Self { rx, target }
    }

    /// Run the OSC sender loop. Blocks the calling thread until the run
    /// finishes or the channel closes.
    pub fn run(&self) {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to bind UDP socket: {}", e);
                return;
            }
        };
        info!("OSC sender → {}", self.target);

        for event in self.rx.iter() {
            for msg in messages_for(&event) {
                if let Err(e) = self.send(&socket, msg) {
                    debug!("OSC send error: {}", e);
                }
            }
            if matches!(event, RunEvent::GroupFinished { .. }) {
                break;
            }
        }
        info!("OSC sender shutting down");
    }

    fn send(&self, socket: &UdpSocket, msg: OscMessage) -> Result<(), Box<dyn std::error::Error>> {
        let buf = rosc::encoder::encode(&OscPacket::Message(msg))?;
        socket.send_to(&buf, &self.target)?;
        Ok(())
    }
}

fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

/// OSC messages describing one event. Bulk payloads (waveforms, spectra)
/// are not forwarded.
pub fn messages_for(event: &RunEvent) -> Vec<OscMessage> {
    match event {
        RunEvent::CurrentRep { rep } => vec![message("/stim/rep", vec![OscType::Int(*rep as i32)])],
        // trace -1 = silence window
        RunEvent::CurrentTrace { test, trace, .. } => vec![message(
            "/stim/trace",
            vec![
                OscType::Int(*test as i32),
                OscType::Int(trace.map_or(-1, |t| t as i32)),
            ],
        )],
        RunEvent::OverVoltage {
            overloaded_attenuation,
        } => vec![message(
            "/stim/overload",
            vec![OscType::Float(*overloaded_attenuation as f32)],
        )],
        RunEvent::CalibrationResponse {
            frequency,
            peak_fft,
            vmax,
            ..
        } => vec![message(
            "/stim/calibration/response",
            vec![
                OscType::Float(*frequency as f32),
                OscType::Float(*peak_fft as f32),
                OscType::Float(*vmax as f32),
            ],
        )],
        RunEvent::AverageResponse {
            frequency,
            intensity,
            db,
        } => vec![message(
            "/stim/calibration/average",
            vec![
                OscType::Float(*frequency as f32),
                OscType::Float(*intensity as f32),
                OscType::Float(*db as f32),
            ],
        )],
        RunEvent::RunFailed { at, message: msg } => vec![message(
            "/stim/failed",
            vec![OscType::String(format!("{} at {}", msg, at))],
        )],
        RunEvent::GroupFinished { halted } => vec![message("/stim/finished", vec![OscType::Bool(*halted)])],
        RunEvent::StimGenerated { .. } | RunEvent::ResponseCollected { .. } => Vec::new(),
    }
}
