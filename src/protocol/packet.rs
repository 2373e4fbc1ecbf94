//! Packet envelope codec.
//!
//! Operates on checksum-verified bodies produced by the frame scanner. The
//! first body byte selects the envelope; point-to-multipoint bodies carry a
//! SAL stream, point-to-point bodies carry exactly one CAL.

use thiserror::Error;

use super::cal::{Cal, CalError};
use super::sal::{Sal, SalError};
use super::{
    checksum, hex_encode, is_confirmation_tag, END_COMMAND, FRAME_START, PCI_ERROR, RESET,
};

const POINT_TO_MULTIPOINT: u8 = 0x05;
const POINT_TO_POINT: u8 = 0x06;
const DEVICE_MANAGEMENT: u8 = 0xA3;
const ROUTING_NONE: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet body too short")]
    ShortFrame,
    #[error("unknown envelope byte {byte:#04x}")]
    UnknownEnvelope { byte: u8 },
    #[error("packet payload truncated")]
    TruncatedPayload,
    #[error(transparent)]
    Cal(#[from] CalError),
    #[error(transparent)]
    Sal(#[from] SalError),
}

/// One decoded packet envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// PCI reset echo.
    Reset,
    /// Command confirmation for `tag`; `.` on the wire means success.
    Confirmation { tag: u8, success: bool },
    /// The PCI could not accept data (bad checksum or full buffer).
    PciError,
    /// Broadcast traffic for one application.
    PointToMultipoint {
        source_address: u8,
        application: u8,
        sals: Vec<Sal>,
        /// Set when the SAL stream decoded partially; the items in `sals`
        /// are still dispatched and the rest of the body was abandoned.
        sal_error: Option<SalError>,
    },
    /// Directed traffic from (or to) one unit.
    PointToPoint {
        unit_address: u8,
        application: u8,
        cal: Cal,
    },
    /// PCI option write, used while initialising the interface.
    DeviceManagement { parameter: u8, value: u8 },
}

impl Packet {
    /// Decode a body emitted by the frame scanner.
    pub fn decode(body: &[u8]) -> Result<Packet, PacketError> {
        let (&first, _) = body.split_first().ok_or(PacketError::ShortFrame)?;
        match first {
            POINT_TO_MULTIPOINT => {
                if body.len() < 5 {
                    return Err(PacketError::ShortFrame);
                }
                let application = body[2];
                let (sals, sal_error) = Sal::decode_stream(application, &body[4..]);
                if sals.is_empty() {
                    return match sal_error {
                        Some(err) => Err(err.into()),
                        None => Err(PacketError::TruncatedPayload),
                    };
                }
                Ok(Packet::PointToMultipoint {
                    source_address: body[1],
                    application,
                    sals,
                    sal_error,
                })
            }
            POINT_TO_POINT => {
                if body.len() < 4 {
                    return Err(PacketError::ShortFrame);
                }
                let application = body[2];
                let cal = Cal::decode(application, &body[3..])?;
                Ok(Packet::PointToPoint {
                    unit_address: body[1],
                    application,
                    cal,
                })
            }
            DEVICE_MANAGEMENT => {
                if body.len() < 4 {
                    return Err(PacketError::ShortFrame);
                }
                Ok(Packet::DeviceManagement {
                    parameter: body[1],
                    value: body[3],
                })
            }
            RESET => Ok(Packet::Reset),
            PCI_ERROR => Ok(Packet::PciError),
            tag if is_confirmation_tag(tag) => {
                let indicator = *body.get(1).ok_or(PacketError::ShortFrame)?;
                match indicator {
                    b'.' => Ok(Packet::Confirmation { tag, success: true }),
                    b'!' => Ok(Packet::Confirmation {
                        tag,
                        success: false,
                    }),
                    byte => Err(PacketError::UnknownEnvelope { byte }),
                }
            }
            byte => Err(PacketError::UnknownEnvelope { byte }),
        }
    }

    /// Encode the packet's body bytes (no checksum, no framing).
    pub fn encode_body(&self) -> Result<Vec<u8>, PacketError> {
        match self {
            Packet::Reset => Ok(vec![RESET]),
            Packet::PciError => Ok(vec![PCI_ERROR]),
            Packet::Confirmation { tag, success } => {
                Ok(vec![*tag, if *success { b'.' } else { b'!' }])
            }
            Packet::PointToMultipoint {
                source_address,
                application,
                sals,
                ..
            } => {
                let mut body = vec![
                    POINT_TO_MULTIPOINT,
                    *source_address,
                    *application,
                    ROUTING_NONE,
                ];
                for sal in sals {
                    sal.encode(&mut body)?;
                }
                if body.len() == 4 {
                    return Err(PacketError::TruncatedPayload);
                }
                Ok(body)
            }
            Packet::PointToPoint {
                unit_address,
                application,
                cal,
            } => {
                let mut body = vec![POINT_TO_POINT, *unit_address, *application];
                cal.encode(&mut body)?;
                Ok(body)
            }
            Packet::DeviceManagement { parameter, value } => Ok(vec![
                DEVICE_MANAGEMENT,
                *parameter,
                ROUTING_NONE,
                *value,
            ]),
        }
    }
}

/// Frame a body for smart mode: `\` + hex(body ∥ tag? ∥ checksum) + CR.
///
/// The confirmation tag, when requested, is spliced in as the last body
/// byte before the checksum is computed.
pub fn smart_frame(body: &[u8], tag: Option<u8>) -> Vec<u8> {
    let mut full = body.to_vec();
    if let Some(tag) = tag {
        full.push(tag);
    }
    full.push(checksum(&full));

    let mut frame = Vec::with_capacity(full.len() * 2 + 2);
    frame.push(FRAME_START);
    frame.extend_from_slice(&hex_encode(&full));
    frame.push(END_COMMAND);
    frame
}

/// Frame a body for basic mode: bare hex, no checksum, CR terminated.
///
/// Used only for the PCI option writes sent while the interface is still in
/// basic mode, before smart mode is active.
pub fn basic_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = hex_encode(body);
    frame.push(END_COMMAND);
    frame
}
