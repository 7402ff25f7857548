//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of footer-milter.
//
// footer-milter is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// footer-milter is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// footer-milter. If not, see <http://www.gnu.org/licenses/>.

//! Framing and encoding of milter protocol packets.
//!
//! Every packet is a 32-bit big-endian length, covering the command byte and
//! the payload, followed by the command byte and the payload.

use std::io::{self, Read, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::support::error::Error;

/// The largest packet accepted from the MTA.
pub const MAX_PACKET: usize = 1024 * 1024;
/// The largest body chunk sent in a single replace-body packet.
pub const MAX_BODY_CHUNK: usize = 65535;
/// The protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 6;

bitflags! {
    /// Modifications a filter may make (`SMFIF_*`).
    pub struct Actions: u32 {
        const ADD_HEADERS = 0x01;
        const CHANGE_BODY = 0x02;
        const ADD_RCPT = 0x04;
        const DELETE_RCPT = 0x08;
        const CHANGE_HEADERS = 0x10;
        const QUARANTINE = 0x20;
        const CHANGE_FROM = 0x40;
        const ADD_RCPT_PAR = 0x80;
        const SET_SYMLIST = 0x100;
    }
}

bitflags! {
    /// Protocol steps the MTA may leave out or not wait for (`SMFIP_*`).
    pub struct Protocol: u32 {
        const NO_CONNECT = 0x01;
        const NO_HELO = 0x02;
        const NO_MAIL = 0x04;
        const NO_RCPT = 0x08;
        const NO_BODY = 0x10;
        const NO_HEADERS = 0x20;
        const NO_EOH = 0x40;
        const NR_HEADER = 0x80;
        const NO_UNKNOWN = 0x100;
        const NO_DATA = 0x200;
        const SKIP = 0x400;
        const RCPT_REJ = 0x800;
        const NR_CONNECT = 0x1000;
        const NR_HELO = 0x2000;
        const NR_MAIL = 0x4000;
        const NR_RCPT = 0x8000;
        const NR_DATA = 0x10000;
        const NR_UNKNOWN = 0x20000;
        const NR_EOH = 0x40000;
        const NR_BODY = 0x80000;
        const HEADER_LEADING_SPACE = 0x100000;
    }
}

/// A packet sent by the MTA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    OptionNegotiation {
        version: u32,
        actions: Actions,
        protocol: Protocol,
    },
    /// Macro definitions for the command identified by `stage`.
    Macros {
        stage: u8,
        macros: Vec<(String, String)>,
    },
    Connect {
        hostname: String,
        /// `4`, `6`, `L` (UNIX socket) or `U` (unknown).
        family: u8,
        port: u16,
        address: String,
    },
    Helo(String),
    /// `MAIL FROM` arguments, the sender first.
    Mail(Vec<String>),
    Recipient(Vec<String>),
    Data,
    Header {
        name: Vec<u8>,
        value: Vec<u8>,
    },
    EndOfHeaders,
    Body(Vec<u8>),
    /// End of the message, possibly with a final body chunk.
    EndOfBody(Vec<u8>),
    Abort,
    Quit,
    /// Quit, but keep the connection for a new SMTP session.
    QuitNewConnection,
    Unknown(Vec<u8>),
}

/// A packet sent to the MTA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    OptionNegotiation {
        version: u32,
        actions: Actions,
        protocol: Protocol,
    },
    Continue,
    /// The complete new body; sent as as many packets as needed.
    ReplaceBody(Vec<u8>),
    AddHeader {
        name: String,
        value: String,
    },
}

/// Read the next command from `r`.
///
/// Returns `None` if the MTA closed the connection between packets.
pub fn read_command(mut r: impl Read) -> Result<Option<Command>, Error> {
    let mut length = [0u8; 4];
    match r.read_exact(&mut length) {
        Ok(()) => (),
        Err(e) if io::ErrorKind::UnexpectedEof == e.kind() => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = BigEndian::read_u32(&length) as usize;
    if 0 == length {
        return Err(Error::MalformedPacket("empty packet"));
    }
    if length > MAX_PACKET {
        return Err(Error::PacketTooLarge(length));
    }

    let mut packet = vec![0u8; length];
    r.read_exact(&mut packet)?;
    parse_command(packet[0], &packet[1..]).map(Some)
}

fn parse_command(code: u8, payload: &[u8]) -> Result<Command, Error> {
    let command = match code {
        b'O' => {
            let mut r = payload;
            let version = r.read_u32::<BigEndian>().map_err(truncated)?;
            let actions = r.read_u32::<BigEndian>().map_err(truncated)?;
            let protocol = r.read_u32::<BigEndian>().map_err(truncated)?;
            Command::OptionNegotiation {
                version,
                actions: Actions::from_bits_truncate(actions),
                protocol: Protocol::from_bits_truncate(protocol),
            }
        },

        b'D' => {
            let (&stage, mut rest) = payload
                .split_first()
                .ok_or(Error::MalformedPacket("macro packet without stage"))?;
            let mut macros = Vec::new();
            while !rest.is_empty() {
                let (name, tail) = split_string(rest)?;
                let (value, tail) = split_string(tail)?;
                macros.push((name, value));
                rest = tail;
            }
            Command::Macros { stage, macros }
        },

        b'C' => {
            let (hostname, rest) = split_string(payload)?;
            let (&family, mut rest) = rest
                .split_first()
                .ok_or(Error::MalformedPacket("connect without family"))?;
            let (port, address) = if b'U' == family {
                (0, String::new())
            } else {
                let port = rest.read_u16::<BigEndian>().map_err(truncated)?;
                (port, split_string(rest)?.0)
            };
            Command::Connect {
                hostname,
                family,
                port,
                address,
            }
        },

        b'H' => Command::Helo(split_string(payload)?.0),
        b'M' => Command::Mail(split_strings(payload)),
        b'R' => Command::Recipient(split_strings(payload)),
        b'T' => Command::Data,

        b'L' => {
            let (name, rest) = split_bytes(payload)?;
            let (value, _) = split_bytes(rest)?;
            Command::Header {
                name: name.to_vec(),
                value: value.to_vec(),
            }
        },

        b'N' => Command::EndOfHeaders,
        b'B' => Command::Body(payload.to_vec()),
        b'E' => Command::EndOfBody(payload.to_vec()),
        b'A' => Command::Abort,
        b'Q' => Command::Quit,
        b'K' => Command::QuitNewConnection,
        b'U' => Command::Unknown(payload.to_vec()),

        _ => return Err(Error::UnknownCommand(code as char)),
    };

    Ok(command)
}

fn truncated(_: io::Error) -> Error {
    Error::MalformedPacket("truncated packet")
}

/// Split a NUL-terminated byte string off the front of `data`.
fn split_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let nul = memchr::memchr(0, data)
        .ok_or(Error::MalformedPacket("unterminated string"))?;
    Ok((&data[..nul], &data[nul + 1..]))
}

fn split_string(data: &[u8]) -> Result<(String, &[u8]), Error> {
    let (s, rest) = split_bytes(data)?;
    Ok((String::from_utf8_lossy(s).into_owned(), rest))
}

/// Split a sequence of NUL-terminated strings. A missing final terminator
/// is tolerated.
fn split_strings(data: &[u8]) -> Vec<String> {
    let data = data.strip_suffix(&[0]).unwrap_or(data);
    if data.is_empty() {
        return Vec::new();
    }

    data.split(|&b| 0 == b)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

impl Response {
    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        match *self {
            Response::OptionNegotiation {
                version,
                actions,
                protocol,
            } => {
                let mut payload = Vec::with_capacity(12);
                payload.write_u32::<BigEndian>(version)?;
                payload.write_u32::<BigEndian>(actions.bits())?;
                payload.write_u32::<BigEndian>(protocol.bits())?;
                write_packet(&mut w, b'O', &[&payload])
            },
            Response::Continue => write_packet(&mut w, b'c', &[]),
            Response::ReplaceBody(ref body) => {
                for chunk in body.chunks(MAX_BODY_CHUNK) {
                    write_packet(&mut w, b'b', &[chunk])?;
                }
                Ok(())
            },
            Response::AddHeader {
                ref name,
                ref value,
            } => write_packet(
                &mut w,
                b'h',
                &[
                    name.as_bytes(),
                    b"\0",
                    fold_header_value(value).as_bytes(),
                    b"\0",
                ],
            ),
        }
    }
}

fn write_packet(
    mut w: impl Write,
    code: u8,
    payload: &[&[u8]],
) -> io::Result<()> {
    let length = 1 + payload.iter().map(|p| p.len()).sum::<usize>();
    w.write_u32::<BigEndian>(length as u32)?;
    w.write_u8(code)?;
    for part in payload {
        w.write_all(part)?;
    }
    Ok(())
}

/// Make every line break in `value` a header continuation.
fn fold_header_value(value: &str) -> String {
    let mut folded = String::with_capacity(value.len() + 8);
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        folded.push(c);
        if '\n' == c && !matches!(chars.peek(), Some(' ') | Some('\t')) {
            folded.push('\t');
        }
    }
    folded
}
