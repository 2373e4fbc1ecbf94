//! CAL (Common Application Language) payload codec.
//!
//! Point-to-point packets carry exactly one CAL. Replies from units use a
//! header byte whose upper nibble selects the kind and whose lower nibble
//! carries a short length where the kind needs one; status reports have
//! fixed-size bodies implied by the kind.
//!
//! Level reports pack sixteen group levels, two bytes per group, each byte a
//! duplicated nibble: a group at level `L` travels as `(L&0x0F)*0x11`
//! followed by `(L>>4)*0x11`, so `00 00` is off and `FF FF` is full on.

use thiserror::Error;

const IDENTIFY: u8 = 0x21;
const STATUS_REQUEST: u8 = 0x2A;
const ACKNOWLEDGE: u8 = 0x32;
const REPLY_BASE: u8 = 0x80;
const IDENTIFY_REPLY_BASE: u8 = 0x90;
const BINARY_STATUS: u8 = 0xC8;
const LEVEL_STATUS: u8 = 0xF0;

const CODING_BINARY: u8 = 0x00;
const CODING_LEVEL: u8 = 0x07;

/// Groups covered by one level status report.
pub const LEVEL_REPORT_GROUPS: usize = 16;
/// Groups covered by one binary status report (two bits per group).
pub const BINARY_REPORT_GROUPS: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalError {
    #[error("CAL payload overruns the packet body")]
    Truncated,
    #[error("unknown CAL header byte {header:#04x}")]
    UnknownKind { header: u8 },
    #[error("unexpected trailing bytes after CAL payload")]
    TrailingBytes,
    #[error("status report payload has the wrong size")]
    BadReportSize,
}

/// Status report flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Binary,
    Level,
}

impl StatusKind {
    fn coding(self) -> u8 {
        match self {
            StatusKind::Binary => CODING_BINARY,
            StatusKind::Level => CODING_LEVEL,
        }
    }

    fn from_coding(byte: u8) -> Option<Self> {
        match byte {
            CODING_BINARY => Some(StatusKind::Binary),
            CODING_LEVEL => Some(StatusKind::Level),
            _ => None,
        }
    }
}

/// Payload of a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusData {
    /// Raw two-bit-per-group data covering 32 groups.
    Binary(Vec<u8>),
    /// Sixteen expanded levels, one byte per group.
    Levels(Vec<u8>),
}

impl StatusData {
    pub fn kind(&self) -> StatusKind {
        match self {
            StatusData::Binary(_) => StatusKind::Binary,
            StatusData::Levels(_) => StatusKind::Level,
        }
    }
}

/// One decoded CAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cal {
    /// Parameter recall reply.
    Reply { parameter: u8, value: Vec<u8> },
    /// Bare acknowledgement.
    Acknowledge,
    /// Bulk group status starting at `block_start`.
    StatusReport {
        application: u8,
        block_start: u8,
        data: StatusData,
    },
    /// Reply to an identify request; `value` is ASCII.
    IdentifyReply { attribute: u8, value: Vec<u8> },
    /// Outbound: ask a unit to identify itself.
    Identify { attribute: u8 },
    /// Outbound: ask for a status report block.
    StatusRequest {
        kind: StatusKind,
        application: u8,
        block_start: u8,
    },
}

impl Cal {
    /// Decode the single CAL occupying `body`.
    ///
    /// `application` comes from the point-to-point envelope header and is
    /// attached to status reports so the dispatcher does not need to thread
    /// it separately.
    pub fn decode(application: u8, body: &[u8]) -> Result<Cal, CalError> {
        let (&header, rest) = body.split_first().ok_or(CalError::Truncated)?;
        match header {
            IDENTIFY => {
                let attribute = *rest.first().ok_or(CalError::Truncated)?;
                finish(&rest[1..], Cal::Identify { attribute })
            }
            STATUS_REQUEST => {
                if rest.len() < 3 {
                    return Err(CalError::Truncated);
                }
                let kind = StatusKind::from_coding(rest[0])
                    .ok_or(CalError::UnknownKind { header: rest[0] })?;
                finish(
                    &rest[3..],
                    Cal::StatusRequest {
                        kind,
                        application: rest[1],
                        block_start: rest[2],
                    },
                )
            }
            ACKNOWLEDGE => finish(rest, Cal::Acknowledge),
            _ if header & 0xF0 == REPLY_BASE => {
                let len = usize::from(header & 0x0F);
                if rest.len() < len + 1 {
                    return Err(CalError::Truncated);
                }
                finish(
                    &rest[len + 1..],
                    Cal::Reply {
                        parameter: rest[0],
                        value: rest[1..=len].to_vec(),
                    },
                )
            }
            _ if header & 0xF0 == IDENTIFY_REPLY_BASE => {
                let len = usize::from(header & 0x0F);
                if rest.len() < len + 1 {
                    return Err(CalError::Truncated);
                }
                finish(
                    &rest[len + 1..],
                    Cal::IdentifyReply {
                        attribute: rest[0],
                        value: rest[1..=len].to_vec(),
                    },
                )
            }
            BINARY_STATUS => {
                let want = 1 + BINARY_REPORT_GROUPS / 4;
                if rest.len() < want {
                    return Err(CalError::Truncated);
                }
                finish(
                    &rest[want..],
                    Cal::StatusReport {
                        application,
                        block_start: rest[0],
                        data: StatusData::Binary(rest[1..want].to_vec()),
                    },
                )
            }
            LEVEL_STATUS => {
                let want = 1 + LEVEL_REPORT_GROUPS * 2;
                if rest.len() < want {
                    return Err(CalError::Truncated);
                }
                let levels = rest[1..want]
                    .chunks_exact(2)
                    .map(|pair| decode_level_pair(pair[0], pair[1]))
                    .collect();
                finish(
                    &rest[want..],
                    Cal::StatusReport {
                        application,
                        block_start: rest[0],
                        data: StatusData::Levels(levels),
                    },
                )
            }
            header => Err(CalError::UnknownKind { header }),
        }
    }

    /// Append this CAL's wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CalError> {
        match self {
            Cal::Identify { attribute } => out.extend_from_slice(&[IDENTIFY, *attribute]),
            Cal::StatusRequest {
                kind,
                application,
                block_start,
            } => out.extend_from_slice(&[STATUS_REQUEST, kind.coding(), *application, *block_start]),
            Cal::Acknowledge => out.push(ACKNOWLEDGE),
            Cal::Reply { parameter, value } => {
                if value.len() > 0x0F {
                    return Err(CalError::BadReportSize);
                }
                out.push(REPLY_BASE | value.len() as u8);
                out.push(*parameter);
                out.extend_from_slice(value);
            }
            Cal::IdentifyReply { attribute, value } => {
                if value.len() > 0x0F {
                    return Err(CalError::BadReportSize);
                }
                out.push(IDENTIFY_REPLY_BASE | value.len() as u8);
                out.push(*attribute);
                out.extend_from_slice(value);
            }
            Cal::StatusReport {
                block_start, data, ..
            } => match data {
                StatusData::Binary(bytes) => {
                    if bytes.len() != BINARY_REPORT_GROUPS / 4 {
                        return Err(CalError::BadReportSize);
                    }
                    out.push(BINARY_STATUS);
                    out.push(*block_start);
                    out.extend_from_slice(bytes);
                }
                StatusData::Levels(levels) => {
                    if levels.len() != LEVEL_REPORT_GROUPS {
                        return Err(CalError::BadReportSize);
                    }
                    out.push(LEVEL_STATUS);
                    out.push(*block_start);
                    for &level in levels {
                        let (lo, hi) = encode_level_pair(level);
                        out.push(lo);
                        out.push(hi);
                    }
                }
            },
        }
        Ok(())
    }
}

fn finish(rest: &[u8], cal: Cal) -> Result<Cal, CalError> {
    if rest.is_empty() {
        Ok(cal)
    } else {
        Err(CalError::TrailingBytes)
    }
}

/// Encode a level as its duplicated-nibble byte pair.
pub fn encode_level_pair(level: u8) -> (u8, u8) {
    ((level & 0x0F) * 0x11, (level >> 4) * 0x11)
}

/// Decode a duplicated-nibble byte pair back to a level.
pub fn decode_level_pair(lo: u8, hi: u8) -> u8 {
    (lo & 0x0F) | (hi & 0xF0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(cal: Cal) {
        let mut body = Vec::new();
        cal.encode(&mut body).unwrap();
        assert_eq!(Cal::decode(0x38, &body), Ok(cal));
    }

    #[test]
    fn level_pairs_cover_the_full_range() {
        for level in 0..=255u8 {
            let (lo, hi) = encode_level_pair(level);
            assert_eq!(decode_level_pair(lo, hi), level);
        }
        assert_eq!(encode_level_pair(0), (0x00, 0x00));
        assert_eq!(encode_level_pair(255), (0xFF, 0xFF));
    }

    #[test]
    fn replies_round_trip() {
        round_trip(Cal::Reply {
            parameter: 0x30,
            value: vec![0x79],
        });
        round_trip(Cal::Acknowledge);
        round_trip(Cal::IdentifyReply {
            attribute: 1,
            value: b"5500CN".to_vec(),
        });
    }

    #[test]
    fn requests_round_trip() {
        round_trip(Cal::Identify { attribute: 0 });
        round_trip(Cal::StatusRequest {
            kind: StatusKind::Level,
            application: 0x38,
            block_start: 0x40,
        });
        round_trip(Cal::StatusRequest {
            kind: StatusKind::Binary,
            application: 0x30,
            block_start: 0,
        });
    }

    #[test]
    fn level_report_decodes_alternating_full_and_off() {
        let mut body = vec![LEVEL_STATUS, 0x40];
        for i in 0..LEVEL_REPORT_GROUPS {
            if i % 2 == 0 {
                body.extend_from_slice(&[0xFF, 0xFF]);
            } else {
                body.extend_from_slice(&[0x00, 0x00]);
            }
        }

        let cal = Cal::decode(0x38, &body).unwrap();
        let Cal::StatusReport {
            application,
            block_start,
            data: StatusData::Levels(levels),
        } = cal
        else {
            panic!("expected a level status report, got {cal:?}");
        };
        assert_eq!(application, 0x38);
        assert_eq!(block_start, 0x40);
        assert_eq!(levels.len(), 16);
        for (i, &level) in levels.iter().enumerate() {
            assert_eq!(level, if i % 2 == 0 { 255 } else { 0 });
        }
    }

    #[test]
    fn binary_report_round_trips() {
        round_trip(Cal::StatusReport {
            application: 0x38,
            block_start: 0x20,
            data: StatusData::Binary(vec![0x55; 8]),
        });
    }

    #[test]
    fn truncated_report_is_rejected() {
        let body = [LEVEL_STATUS, 0x40, 0xFF, 0xFF];
        assert_eq!(Cal::decode(0x38, &body), Err(CalError::Truncated));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let body = [ACKNOWLEDGE, 0x00];
        assert_eq!(Cal::decode(0x38, &body), Err(CalError::TrailingBytes));
    }

    #[test]
    fn unknown_header_is_rejected() {
        assert_eq!(
            Cal::decode(0x38, &[0x40]),
            Err(CalError::UnknownKind { header: 0x40 })
        );
    }
}
