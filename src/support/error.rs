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

use std::io;

use thiserror::Error;

use crate::mime::parser::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed milter packet: {0}")]
    MalformedPacket(&'static str),
    #[error("Milter packet of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),
    #[error("Unknown milter command {0:?}")]
    UnknownCommand(char),
    #[error("Footer catalog '{0}': {1}")]
    FooterCatalog(String, String),
    #[error("Unable to reserve {0} bytes of buffer space")]
    BufferReservation(usize),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
