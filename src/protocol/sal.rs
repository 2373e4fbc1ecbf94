//! SAL (Smart Application Language) payload codec.
//!
//! A point-to-multipoint packet body carries a concatenation of
//! self-delimiting SAL items for a single application; each item starts with
//! an opcode that implies its own length. The decoder is driven by the
//! application byte from the packet header, because opcodes are only unique
//! within one application.

use thiserror::Error;

use super::application;

/// Ramp duration table, seconds, indexed by duration code.
///
/// Codes map to opcodes `0x02 + 8 * code`; code 0 ramps "instantly".
pub const RAMP_DURATIONS: [u16; 16] = [
    0, 4, 8, 12, 20, 30, 40, 60, 90, 120, 180, 300, 420, 600, 900, 1020,
];

const LIGHTING_ON: u8 = 0x79;
const LIGHTING_OFF: u8 = 0x01;
const LIGHTING_TERMINATE_RAMP: u8 = 0x09;
const RAMP_OPCODE_BASE: u8 = 0x02;
const RAMP_OPCODE_LAST: u8 = 0x7A;
const CLOCK_UPDATE: u8 = 0x08;
const CLOCK_REQUEST: u8 = 0x11;
const TEMPERATURE_BROADCAST: u8 = 0x02;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SalError {
    #[error("SAL item overruns the packet body")]
    Truncated,
    #[error("unknown SAL opcode {opcode:#04x} for application {application:#04x}")]
    UnknownOpcode { application: u8, opcode: u8 },
    #[error("unknown clock attribute {attribute:#04x}")]
    UnknownClockAttribute { attribute: u8 },
    #[error("application {application:#04x} carries no known SALs")]
    UnsupportedApplication { application: u8 },
    #[error("ramp duration code {code} out of range")]
    BadDurationCode { code: u8 },
}

/// Clock SAL attribute selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAttribute {
    Time,
    Date,
}

impl ClockAttribute {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ClockAttribute::Time),
            0x02 => Some(ClockAttribute::Date),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ClockAttribute::Time => 0x01,
            ClockAttribute::Date => 0x02,
        }
    }
}

/// One decoded SAL item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sal {
    /// Lighting: switch a group fully on.
    On { group: u8 },
    /// Lighting: switch a group fully off.
    Off { group: u8 },
    /// Lighting: fade a group to `level` over the coded duration.
    Ramp {
        group: u8,
        level: u8,
        duration_code: u8,
    },
    /// Lighting: stop an in-progress ramp at its current level.
    TerminateRamp { group: u8 },
    /// Clock: time-of-day broadcast.
    TimeUpdate {
        hour: u8,
        minute: u8,
        second: u8,
        fractional: u8,
    },
    /// Clock: date broadcast.
    DateUpdate {
        year: u16,
        month: u8,
        day: u8,
        day_of_week: u8,
    },
    /// Clock: a unit asking the network for the time or date.
    ClockRequest { attribute: ClockAttribute },
    /// Temperature broadcast in whole degrees.
    Temperature { group: u8, degrees: u8 },
}

impl Sal {
    /// Decode a SAL stream for `application`.
    ///
    /// Items already decoded when an error is hit are still returned; the
    /// rest of the body is abandoned.
    pub fn decode_stream(application: u8, body: &[u8]) -> (Vec<Sal>, Option<SalError>) {
        let mut sals = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            match Self::decode_one(application, rest) {
                Ok((sal, consumed)) => {
                    sals.push(sal);
                    rest = &rest[consumed..];
                }
                Err(err) => return (sals, Some(err)),
            }
        }
        (sals, None)
    }

    fn decode_one(app: u8, body: &[u8]) -> Result<(Sal, usize), SalError> {
        if application::is_lighting(app) {
            return Self::decode_lighting(app, body);
        }
        match app {
            application::CLOCK => Self::decode_clock(body),
            application::TEMPERATURE => Self::decode_temperature(body),
            _ => Err(SalError::UnsupportedApplication { application: app }),
        }
    }

    fn decode_lighting(app: u8, body: &[u8]) -> Result<(Sal, usize), SalError> {
        let opcode = body[0];
        match opcode {
            LIGHTING_ON => {
                let group = *body.get(1).ok_or(SalError::Truncated)?;
                Ok((Sal::On { group }, 2))
            }
            LIGHTING_OFF => {
                let group = *body.get(1).ok_or(SalError::Truncated)?;
                Ok((Sal::Off { group }, 2))
            }
            LIGHTING_TERMINATE_RAMP => {
                let group = *body.get(1).ok_or(SalError::Truncated)?;
                Ok((Sal::TerminateRamp { group }, 2))
            }
            op if is_ramp_opcode(op) => {
                if body.len() < 3 {
                    return Err(SalError::Truncated);
                }
                Ok((
                    Sal::Ramp {
                        group: body[1],
                        level: body[2],
                        duration_code: (op - RAMP_OPCODE_BASE) / 8,
                    },
                    3,
                ))
            }
            opcode => Err(SalError::UnknownOpcode {
                application: app,
                opcode,
            }),
        }
    }

    fn decode_clock(body: &[u8]) -> Result<(Sal, usize), SalError> {
        match body[0] {
            CLOCK_UPDATE => {
                let attribute = *body.get(1).ok_or(SalError::Truncated)?;
                match ClockAttribute::from_byte(attribute) {
                    Some(ClockAttribute::Time) => {
                        if body.len() < 6 {
                            return Err(SalError::Truncated);
                        }
                        Ok((
                            Sal::TimeUpdate {
                                hour: body[2],
                                minute: body[3],
                                second: body[4],
                                fractional: body[5],
                            },
                            6,
                        ))
                    }
                    Some(ClockAttribute::Date) => {
                        if body.len() < 7 {
                            return Err(SalError::Truncated);
                        }
                        Ok((
                            Sal::DateUpdate {
                                year: u16::from(body[2]) << 8 | u16::from(body[3]),
                                month: body[4],
                                day: body[5],
                                day_of_week: body[6],
                            },
                            7,
                        ))
                    }
                    None => Err(SalError::UnknownClockAttribute { attribute }),
                }
            }
            CLOCK_REQUEST => {
                let attribute = *body.get(1).ok_or(SalError::Truncated)?;
                let attribute = ClockAttribute::from_byte(attribute)
                    .ok_or(SalError::UnknownClockAttribute { attribute })?;
                Ok((Sal::ClockRequest { attribute }, 2))
            }
            opcode => Err(SalError::UnknownOpcode {
                application: application::CLOCK,
                opcode,
            }),
        }
    }

    fn decode_temperature(body: &[u8]) -> Result<(Sal, usize), SalError> {
        match body[0] {
            TEMPERATURE_BROADCAST => {
                if body.len() < 3 {
                    return Err(SalError::Truncated);
                }
                Ok((
                    Sal::Temperature {
                        group: body[1],
                        degrees: body[2],
                    },
                    3,
                ))
            }
            opcode => Err(SalError::UnknownOpcode {
                application: application::TEMPERATURE,
                opcode,
            }),
        }
    }

    /// Append this item's wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), SalError> {
        match *self {
            Sal::On { group } => out.extend_from_slice(&[LIGHTING_ON, group]),
            Sal::Off { group } => out.extend_from_slice(&[LIGHTING_OFF, group]),
            Sal::TerminateRamp { group } => {
                out.extend_from_slice(&[LIGHTING_TERMINATE_RAMP, group])
            }
            Sal::Ramp {
                group,
                level,
                duration_code,
            } => {
                if usize::from(duration_code) >= RAMP_DURATIONS.len() {
                    return Err(SalError::BadDurationCode {
                        code: duration_code,
                    });
                }
                out.extend_from_slice(&[RAMP_OPCODE_BASE + 8 * duration_code, group, level]);
            }
            Sal::TimeUpdate {
                hour,
                minute,
                second,
                fractional,
            } => out.extend_from_slice(&[
                CLOCK_UPDATE,
                ClockAttribute::Time.as_byte(),
                hour,
                minute,
                second,
                fractional,
            ]),
            Sal::DateUpdate {
                year,
                month,
                day,
                day_of_week,
            } => out.extend_from_slice(&[
                CLOCK_UPDATE,
                ClockAttribute::Date.as_byte(),
                (year >> 8) as u8,
                (year & 0xFF) as u8,
                month,
                day,
                day_of_week,
            ]),
            Sal::ClockRequest { attribute } => {
                out.extend_from_slice(&[CLOCK_REQUEST, attribute.as_byte()])
            }
            Sal::Temperature { group, degrees } => {
                out.extend_from_slice(&[TEMPERATURE_BROADCAST, group, degrees])
            }
        }
        Ok(())
    }
}

fn is_ramp_opcode(op: u8) -> bool {
    (RAMP_OPCODE_BASE..=RAMP_OPCODE_LAST).contains(&op) && (op - RAMP_OPCODE_BASE) % 8 == 0
}

/// Smallest duration code whose table entry covers `seconds`.
///
/// Returns `None` when `seconds` exceeds the longest supported ramp
/// (1020 s); the network simply cannot express it.
pub fn duration_code_for(seconds: u16) -> Option<u8> {
    RAMP_DURATIONS
        .iter()
        .position(|&d| d >= seconds)
        .map(|idx| idx as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::application::{CLOCK, LIGHTING, TEMPERATURE};

    fn round_trip(app: u8, sal: Sal) {
        let mut body = Vec::new();
        sal.encode(&mut body).unwrap();
        let (decoded, err) = Sal::decode_stream(app, &body);
        assert_eq!(err, None);
        assert_eq!(decoded, vec![sal]);
    }

    #[test]
    fn lighting_round_trips() {
        round_trip(LIGHTING, Sal::On { group: 100 });
        round_trip(LIGHTING, Sal::Off { group: 0 });
        round_trip(LIGHTING, Sal::TerminateRamp { group: 255 });
        round_trip(
            LIGHTING,
            Sal::Ramp {
                group: 7,
                level: 128,
                duration_code: 5,
            },
        );
    }

    #[test]
    fn clock_round_trips() {
        round_trip(
            CLOCK,
            Sal::TimeUpdate {
                hour: 12,
                minute: 34,
                second: 56,
                fractional: 0,
            },
        );
        round_trip(
            CLOCK,
            Sal::DateUpdate {
                year: 2024,
                month: 2,
                day: 29,
                day_of_week: 4,
            },
        );
        round_trip(
            CLOCK,
            Sal::ClockRequest {
                attribute: ClockAttribute::Time,
            },
        );
    }

    #[test]
    fn temperature_round_trips() {
        round_trip(
            TEMPERATURE,
            Sal::Temperature {
                group: 3,
                degrees: 21,
            },
        );
    }

    #[test]
    fn several_items_decode_in_wire_order() {
        let mut body = Vec::new();
        Sal::On { group: 1 }.encode(&mut body).unwrap();
        Sal::Off { group: 2 }.encode(&mut body).unwrap();
        Sal::Ramp {
            group: 3,
            level: 99,
            duration_code: 0,
        }
        .encode(&mut body)
        .unwrap();

        let (sals, err) = Sal::decode_stream(LIGHTING, &body);
        assert_eq!(err, None);
        assert_eq!(
            sals,
            vec![
                Sal::On { group: 1 },
                Sal::Off { group: 2 },
                Sal::Ramp {
                    group: 3,
                    level: 99,
                    duration_code: 0
                },
            ]
        );
    }

    #[test]
    fn decoded_prefix_survives_a_bad_tail() {
        // 0x68 is not a lighting opcode; the leading item still decodes.
        let body = [0x79, 0x64, 0x68];
        let (sals, err) = Sal::decode_stream(LIGHTING, &body);
        assert_eq!(sals, vec![Sal::On { group: 100 }]);
        assert_eq!(
            err,
            Some(SalError::UnknownOpcode {
                application: LIGHTING,
                opcode: 0x68
            })
        );
    }

    #[test]
    fn truncated_ramp_reports_truncation() {
        let body = [0x0A, 0x07];
        let (sals, err) = Sal::decode_stream(LIGHTING, &body);
        assert!(sals.is_empty());
        assert_eq!(err, Some(SalError::Truncated));
    }

    #[test]
    fn ramp_opcode_mapping_matches_the_duration_table() {
        for (code, &seconds) in RAMP_DURATIONS.iter().enumerate() {
            let code = code as u8;
            let body = [RAMP_OPCODE_BASE + 8 * code, 1, 2];
            let (sals, err) = Sal::decode_stream(LIGHTING, &body);
            assert_eq!(err, None);
            assert_eq!(
                sals,
                vec![Sal::Ramp {
                    group: 1,
                    level: 2,
                    duration_code: code
                }]
            );
            assert!(RAMP_DURATIONS[usize::from(code)] == seconds);
        }
    }

    #[test]
    fn duration_code_picks_the_smallest_covering_entry() {
        assert_eq!(duration_code_for(0), Some(0));
        assert_eq!(duration_code_for(1), Some(1));
        assert_eq!(duration_code_for(4), Some(1));
        assert_eq!(duration_code_for(5), Some(2));
        assert_eq!(duration_code_for(1020), Some(15));
        assert_eq!(duration_code_for(1021), None);
    }

    #[test]
    fn lighting_opcodes_do_not_collide_with_ramp_codes() {
        for op in [0x79u8, 0x01, 0x09] {
            assert!(!is_ramp_opcode(op));
        }
    }
}
