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

//! Transfer encoding and charset conversion for the bodies of leaf parts.

use std::borrow::Cow;

use thiserror::Error;

use super::header::ContentTransferEncoding;
use super::quoted_printable::{qp_decode, qp_encode};

/// Length of a line of base64 output, not counting the line ending.
const BASE64_LINE: usize = 76;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unknown charset {0:?}")]
    UnknownCharset(String),
    #[error("Footer text cannot be represented in {0}")]
    Unrepresentable(&'static str),
    #[error("Body is not valid base64")]
    CorruptBase64,
}

/// The transfer encodings that body rewriting understands.
///
/// `7bit`, `8bit`, and `binary` are all identity encodings as far as the
/// content is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEncoding {
    Identity,
    Base64,
    QuotedPrintable,
}

impl Default for TransferEncoding {
    fn default() -> Self {
        TransferEncoding::Identity
    }
}

impl From<ContentTransferEncoding> for TransferEncoding {
    fn from(cte: ContentTransferEncoding) -> Self {
        use super::header::ContentTransferEncoding as CTE;

        match cte {
            CTE::SevenBit | CTE::EightBit | CTE::Binary => {
                TransferEncoding::Identity
            },
            CTE::Base64 => TransferEncoding::Base64,
            CTE::QuotedPrintable => TransferEncoding::QuotedPrintable,
        }
    }
}

impl TransferEncoding {
    /// Remove this transfer encoding from `data`.
    pub fn decode<'a>(
        self,
        data: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, EncodingError> {
        match self {
            TransferEncoding::Identity => Ok(Cow::Borrowed(data)),
            TransferEncoding::Base64 => decode_base64(data).map(Cow::Owned),
            // A dangling escape at the very end of the body is not valid QP
            // and cannot be completed, so it is simply dropped.
            TransferEncoding::QuotedPrintable => Ok(qp_decode(data).0),
        }
    }

    /// Apply this transfer encoding to `data`.
    ///
    /// Base64 is wrapped into CRLF-terminated lines of 76 characters.
    pub fn encode<'a>(self, data: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            TransferEncoding::Identity => Cow::Borrowed(data),
            TransferEncoding::Base64 => Cow::Owned(encode_base64(data)),
            TransferEncoding::QuotedPrintable => Cow::Owned(qp_encode(data)),
        }
    }
}

fn decode_base64(data: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let filtered = data
        .iter()
        .copied()
        .filter(|&byte| match byte {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'+' | b'/' | b'=' => {
                true
            },
            _ => false,
        })
        .collect::<Vec<u8>>();

    let mut decoded = Vec::with_capacity(filtered.len() / 4 * 3);
    base64::decode_config_buf(&filtered, base64::STANDARD, &mut decoded)
        .map_err(|_| EncodingError::CorruptBase64)?;
    Ok(decoded)
}

fn encode_base64(data: &[u8]) -> Vec<u8> {
    let encoded = base64::encode_config(data, base64::STANDARD);
    let mut out = Vec::with_capacity(
        encoded.len() + encoded.len() / BASE64_LINE * 2 + 2,
    );
    for line in encoded.as_bytes().chunks(BASE64_LINE) {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Look up the character encoding named by a part's `charset` parameter.
///
/// A missing charset means US-ASCII. Charsets whose text cannot be spliced
/// byte-wise (UTF-16 and friends) are rejected along with unknown names.
pub fn charset(
    label: Option<&str>,
) -> Result<&'static encoding_rs::Encoding, EncodingError> {
    let label = label.unwrap_or("us-ascii");
    let encoding =
        encoding_rs::Encoding::for_label_no_replacement(label.as_bytes())
            .ok_or_else(|| EncodingError::UnknownCharset(label.to_owned()))?;

    if encoding.output_encoding() != encoding {
        return Err(EncodingError::Unrepresentable(encoding.name()));
    }

    Ok(encoding)
}

/// Convert `text` into `encoding`, failing if any character has no
/// representation there.
pub fn encode_text(
    text: &str,
    encoding: &'static encoding_rs::Encoding,
) -> Result<Vec<u8>, EncodingError> {
    let (encoded, _, had_errors) = encoding.encode(text);
    if had_errors {
        Err(EncodingError::Unrepresentable(encoding.name()))
    } else {
        Ok(encoded.into_owned())
    }
}
