//! The subset of the Firmata protocol spoken by the HAT coprocessor.
//!
//! ```text
//! Pin mode:       [0xF4] [pin] [mode]
//! Digital port:   [0x90 | port] [value LSB] [value MSB]
//! Report version: [0xF9] [major] [minor]
//! Sysex:          [0xF0] [command] [payload...] [0xF7]
//! ```
//!
//! Sysex payloads only carry 7-bit bytes, so 8-bit data goes over the wire as LSB/MSB pairs.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const DIGITAL_MESSAGE: u8 = 0x90;
const ANALOG_MESSAGE: u8 = 0xE0;
const PIN_MODE: u8 = 0xF4;
const REPORT_VERSION: u8 = 0xF9;
const START_SYSEX: u8 = 0xF0;
const END_SYSEX: u8 = 0xF7;

const STRING_DATA: u8 = 0x71;
const I2C_REQUEST: u8 = 0x76;
const I2C_REPLY: u8 = 0x77;
const I2C_CONFIG: u8 = 0x78;
const REPORT_FIRMWARE: u8 = 0x79;

const I2C_WRITE: u8 = 0b00 << 3;
const I2C_READ_ONCE: u8 = 0b01 << 3;

const MAX_SYSEX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PinMode {
    Input = 0x00,
    Output = 0x01,
}

/// Host to board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryVersion,
    PinMode { pin: u8, mode: PinMode },
    /// Levels of all 8 pins of a port.
    DigitalPort { port: u8, value: u8 },
    I2cConfig { delay_us: u16 },
    I2cWrite { addr: u8, data: Vec<u8> },
    I2cReadOnce { addr: u8, register: u8, len: u16 },
}

/// Board to host. Anything else the board sends is dropped by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version { major: u8, minor: u8 },
    I2cReply { addr: u8, register: u8, data: Vec<u8> },
    String(String),
}

#[derive(Debug, Default)]
pub struct FirmataCodec;

fn put_pairs(dst: &mut BytesMut, data: &[u8]) {
    for b in data {
        dst.put_u8(b & 0x7F);
        dst.put_u8(b >> 7);
    }
}

fn from_pairs(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .map(|x| (x[0] & 0x7F) | (x[1] << 7))
        .collect()
}

fn sysex(cmd: u8, payload: &[u8]) -> Option<Message> {
    match cmd {
        STRING_DATA => Some(Message::String(
            String::from_utf8_lossy(&from_pairs(payload)).to_string(),
        )),
        I2C_REPLY if payload.len() >= 4 => {
            let addr = from_pairs(&payload[..2]);
            let register = from_pairs(&payload[2..4]);
            Some(Message::I2cReply {
                addr: addr[0],
                register: register[0],
                data: from_pairs(&payload[4..]),
            })
        }
        REPORT_FIRMWARE if payload.len() >= 2 => Some(Message::Version {
            major: payload[0],
            minor: payload[1],
        }),
        _ => {
            tracing::trace!("Ignoring sysex {cmd:#04x}");
            None
        }
    }
}

impl Decoder for FirmataCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&first) = src.first() else {
                return Ok(None);
            };

            match first {
                REPORT_VERSION => {
                    if src.len() < 3 {
                        return Ok(None);
                    }
                    let msg = Message::Version {
                        major: src[1],
                        minor: src[2],
                    };
                    src.advance(3);
                    return Ok(Some(msg));
                }
                START_SYSEX => {
                    let Some(end) = src.iter().position(|x| *x == END_SYSEX) else {
                        if src.len() > MAX_SYSEX {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "Unterminated sysex message",
                            ));
                        }
                        return Ok(None);
                    };

                    let frame = src.split_to(end + 1);
                    if frame.len() < 3 {
                        continue;
                    }
                    if let Some(msg) = sysex(frame[1], &frame[2..end]) {
                        return Ok(Some(msg));
                    }
                }
                x if (x & 0xF0) == DIGITAL_MESSAGE || (x & 0xF0) == ANALOG_MESSAGE => {
                    if src.len() < 3 {
                        return Ok(None);
                    }
                    src.advance(3);
                }
                _ => src.advance(1),
            }
        }
    }
}

impl Encoder<Command> for FirmataCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!("TX firmata {item:?}");

        match item {
            Command::QueryVersion => dst.put_u8(REPORT_VERSION),
            Command::PinMode { pin, mode } => {
                dst.put_slice(&[PIN_MODE, pin, mode as u8]);
            }
            Command::DigitalPort { port, value } => {
                dst.put_slice(&[DIGITAL_MESSAGE | (port & 0x0F), value & 0x7F, value >> 7]);
            }
            Command::I2cConfig { delay_us } => {
                dst.put_slice(&[
                    START_SYSEX,
                    I2C_CONFIG,
                    (delay_us & 0x7F) as u8,
                    ((delay_us >> 7) & 0x7F) as u8,
                    END_SYSEX,
                ]);
            }
            Command::I2cWrite { addr, data } => {
                dst.put_slice(&[START_SYSEX, I2C_REQUEST, addr & 0x7F, I2C_WRITE]);
                put_pairs(dst, &data);
                dst.put_u8(END_SYSEX);
            }
            Command::I2cReadOnce {
                addr,
                register,
                len,
            } => {
                dst.put_slice(&[START_SYSEX, I2C_REQUEST, addr & 0x7F, I2C_READ_ONCE]);
                put_pairs(dst, &[register]);
                dst.put_u8((len & 0x7F) as u8);
                dst.put_u8(((len >> 7) & 0x7F) as u8);
                dst.put_u8(END_SYSEX);
            }
        }

        Ok(())
    }
}
