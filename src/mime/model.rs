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

use std::borrow::Cow;
use std::fmt;

use super::content_encoding::TransferEncoding;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrSpec<'a> {
    pub local: Vec<Cow<'a, [u8]>>,
    pub domain: Vec<Cow<'a, [u8]>>,
}

impl fmt::Display for AddrSpec<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn write_dotted(
            f: &mut fmt::Formatter,
            parts: &[Cow<'_, [u8]>],
        ) -> fmt::Result {
            for (ix, part) in parts.iter().enumerate() {
                if ix > 0 {
                    write!(f, ".")?;
                }
                write!(f, "{}", String::from_utf8_lossy(part))?;
            }
            Ok(())
        }

        write_dotted(f, &self.local)?;
        write!(f, "@")?;
        write_dotted(f, &self.domain)
    }
}

/// One node of a parsed message.
///
/// All byte slices borrow from the buffer the message was parsed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MimeEntity<'a> {
    /// The header block exactly as it appeared, including the line ending of
    /// its last line but not the blank line that ends it.
    pub header: &'a [u8],
    /// Everything after the blank line that ends the header block, still
    /// transfer-encoded.
    pub raw_body: &'a [u8],
    /// Lower-case `type/subtype`.
    pub content_type: String,
    /// Lower-case value of the `charset` parameter.
    pub charset: Option<String>,
    pub transfer_encoding: TransferEncoding,
    /// Lower-case disposition type, e.g. `attachment`.
    pub disposition: Option<String>,
    pub body: EntityBody<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityBody<'a> {
    Multipart(Multipart<'a>),
    /// An embedded `message/rfc822`.
    Message(Box<MimeEntity<'a>>),
    /// A `text/*` part with a transfer encoding that can be undone.
    TextLeaf,
    /// Anything else. Never modified.
    BinaryLeaf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Multipart<'a> {
    pub boundary: Vec<u8>,
    /// Text before the first delimiter, without the line ending that belongs
    /// to that delimiter.
    pub preamble: Option<&'a [u8]>,
    /// Text after the line ending of the close delimiter.
    pub epilogue: Option<&'a [u8]>,
    pub children: Vec<MimeEntity<'a>>,
}

impl MimeEntity<'_> {
    pub fn is_subtype(&self, subtype: &str) -> bool {
        self.content_type
            .split('/')
            .nth(1)
            .map_or(false, |t| t == subtype)
    }

    pub fn is_attachment(&self) -> bool {
        Some("attachment") == self.disposition.as_deref()
    }

    /// Whether the content type denotes a signed or encrypted structure, such
    /// as `multipart/signed` or `application/pgp-encrypted`.
    pub fn is_signed_or_encrypted(&self) -> bool {
        self.content_type.contains("signed")
            || self.content_type.contains("encrypted")
    }
}
