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

//! Splits an accumulated message into a tree of `MimeEntity` values.
//!
//! The parser never copies body data; every part of the tree refers back into
//! the original buffer so that untouched parts can be re-emitted exactly.

use std::str;

use thiserror::Error;

use super::content_encoding::TransferEncoding;
use super::header;
use super::model::*;

const MAX_RECURSION: u32 = 20;
const MAX_PARTS: u32 = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} entity has no boundary parameter")]
    MissingBoundary(String),
    #[error("Multipart body never contains its boundary")]
    NoDelimiter,
    #[error("MIME structure is nested too deeply")]
    TooDeep,
    #[error("Message has too many parts")]
    TooManyParts,
}

/// Parse a complete message, headers included.
pub fn parse(message: &[u8]) -> Result<MimeEntity<'_>, ParseError> {
    Parser { part_count: 0 }.entity(message, DefaultType::TextPlain, 0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DefaultType {
    TextPlain,
    MessageRfc822,
}

impl DefaultType {
    fn content_type(self) -> &'static str {
        match self {
            DefaultType::TextPlain => "text/plain",
            DefaultType::MessageRfc822 => "message/rfc822",
        }
    }
}

struct Parser {
    part_count: u32,
}

impl Parser {
    fn entity<'a>(
        &mut self,
        data: &'a [u8],
        default_type: DefaultType,
        depth: u32,
    ) -> Result<MimeEntity<'a>, ParseError> {
        let (header, raw_body) = split_header(data);
        let fields = ContentFields::scan(header);

        let mut content_type = default_type.content_type().to_owned();
        let mut boundary = None;
        let mut charset = None;
        // An unparseable Content-Type is treated like a missing one
        let ct = fields.content_type.and_then(header::parse_content_type);
        if let Some(ct) = ct {
            content_type = format!(
                "{}/{}",
                String::from_utf8_lossy(ct.typ),
                String::from_utf8_lossy(ct.subtype)
            )
            .to_ascii_lowercase();
            boundary = ct.parm("boundary").map(<[u8]>::to_vec);
            charset = ct
                .parm("charset")
                .map(|c| String::from_utf8_lossy(c).to_ascii_lowercase());
        }

        // An encoding we don't understand makes the content opaque
        let (transfer_encoding, opaque) = match fields.transfer_encoding {
            None => (TransferEncoding::Identity, false),
            Some(value) => {
                match header::parse_content_transfer_encoding(value) {
                    Some(cte) => (cte.into(), false),
                    None => (TransferEncoding::Identity, true),
                }
            },
        };

        let disposition = fields
            .disposition
            .and_then(header::parse_content_disposition)
            .map(|cd| {
                String::from_utf8_lossy(cd.disposition).to_ascii_lowercase()
            });

        let body = if content_type.starts_with("multipart/") {
            let boundary = boundary.ok_or_else(|| {
                ParseError::MissingBoundary(content_type.clone())
            })?;
            let child_default = if "multipart/digest" == content_type {
                DefaultType::MessageRfc822
            } else {
                DefaultType::TextPlain
            };

            EntityBody::Multipart(self.multipart(
                raw_body,
                &boundary,
                child_default,
                depth,
            )?)
        } else if "message/rfc822" == content_type
            && !opaque
            && TransferEncoding::Identity == transfer_encoding
        {
            self.embedded_message(raw_body, depth)?
        } else if content_type.starts_with("text/") && !opaque {
            EntityBody::TextLeaf
        } else {
            EntityBody::BinaryLeaf
        };

        Ok(MimeEntity {
            header,
            raw_body,
            content_type,
            charset,
            transfer_encoding,
            disposition,
            body,
        })
    }

    fn embedded_message<'a>(
        &mut self,
        data: &'a [u8],
        depth: u32,
    ) -> Result<EntityBody<'a>, ParseError> {
        if depth >= MAX_RECURSION {
            return Err(ParseError::TooDeep);
        }

        Ok(EntityBody::Message(Box::new(self.entity(
            data,
            DefaultType::TextPlain,
            depth + 1,
        )?)))
    }

    fn multipart<'a>(
        &mut self,
        body: &'a [u8],
        boundary: &[u8],
        child_default: DefaultType,
        depth: u32,
    ) -> Result<Multipart<'a>, ParseError> {
        if depth >= MAX_RECURSION {
            return Err(ParseError::TooDeep);
        }

        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary);

        let mut preamble = None;
        let mut epilogue = None;
        let mut children = Vec::new();
        // Where the content of the current part begins, once the first
        // delimiter has been seen.
        let mut part_start: Option<usize> = None;
        let mut closed = false;
        let mut pos = 0;

        for line in lines(body) {
            let line_start = pos;
            pos += line.len();

            let is_final = match delimiter_kind(line, &delimiter) {
                None => continue,
                Some(is_final) => is_final,
            };

            // The line ending before a delimiter belongs to the delimiter
            let content_end = strip_line_ending(&body[..line_start]).len();
            match part_start {
                None if line_start > 0 => {
                    preamble = Some(&body[..content_end]);
                },
                None => (),
                Some(start) => {
                    let part = &body[start..content_end.max(start)];
                    children.push(self.child(part, child_default, depth)?);
                },
            }

            if is_final {
                closed = true;
                epilogue = Some(&body[pos..]).filter(|e| !e.is_empty());
                break;
            }

            part_start = Some(pos);
        }

        if !closed {
            // Tolerate a missing close delimiter; the last part runs to the
            // end of the body.
            match part_start {
                None => return Err(ParseError::NoDelimiter),
                Some(start) => children.push(self.child(
                    &body[start..],
                    child_default,
                    depth,
                )?),
            }
        }

        Ok(Multipart {
            boundary: boundary.to_vec(),
            preamble,
            epilogue,
            children,
        })
    }

    fn child<'a>(
        &mut self,
        data: &'a [u8],
        default_type: DefaultType,
        depth: u32,
    ) -> Result<MimeEntity<'a>, ParseError> {
        self.part_count += 1;
        if self.part_count > MAX_PARTS {
            return Err(ParseError::TooManyParts);
        }

        self.entity(data, default_type, depth + 1)
    }
}

/// If `line` is a delimiter line for `delimiter` (which includes the leading
/// `--`), return whether it is the close delimiter.
///
/// Only transport padding may follow an ordinary delimiter, so a boundary
/// which is a prefix of a nested boundary is not confused with it.
fn delimiter_kind(line: &[u8], delimiter: &[u8]) -> Option<bool> {
    if !line.starts_with(delimiter) {
        return None;
    }

    let rest = &line[delimiter.len()..];
    if rest.starts_with(b"--") {
        Some(true)
    } else if rest.iter().all(|&b| b" \t\r\n".contains(&b)) {
        Some(false)
    } else {
        None
    }
}

/// Split `data` at the first empty line.
///
/// The header block keeps the line ending of its last line; the empty line
/// itself belongs to neither half. Without any empty line, everything is
/// header.
fn split_header(data: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;
    for line in lines(data) {
        if b"\n" == line || b"\r\n" == line {
            return (&data[..pos], &data[pos + line.len()..]);
        }
        pos += line.len();
    }

    (data, &[])
}

/// Iterate over the lines of `data`, each including its line ending.
fn lines<'a>(data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }

        let end = memchr::memchr(b'\n', rest).map_or(rest.len(), |ix| ix + 1);
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

fn strip_line_ending(data: &[u8]) -> &[u8] {
    if data.ends_with(b"\r\n") {
        &data[..data.len() - 2]
    } else if data.ends_with(b"\n") {
        &data[..data.len() - 1]
    } else {
        data
    }
}

/// Raw values of the header fields which control body interpretation.
///
/// Only the first occurrence of each field counts.
#[derive(Default)]
struct ContentFields<'a> {
    content_type: Option<&'a [u8]>,
    transfer_encoding: Option<&'a [u8]>,
    disposition: Option<&'a [u8]>,
}

impl<'a> ContentFields<'a> {
    fn scan(header: &'a [u8]) -> Self {
        let mut fields = ContentFields::default();
        let mut field_start = None;
        let mut pos = 0;

        for line in lines(header) {
            let is_continuation =
                line.starts_with(b" ") || line.starts_with(b"\t");
            if !is_continuation {
                if let Some(start) = field_start.take() {
                    fields.process(&header[start..pos]);
                }
                field_start = Some(pos);
            }
            pos += line.len();
        }

        if let Some(start) = field_start {
            fields.process(&header[start..pos]);
        }

        fields
    }

    fn process(&mut self, field: &'a [u8]) {
        let mut split = field.splitn(2, |&b| b':' == b);
        let (name, value) = match (split.next(), split.next()) {
            (Some(name), Some(value)) => (name, value),
            _ => return,
        };

        let name = match str::from_utf8(name) {
            Err(_) => return,
            Ok(name) => name.trim(),
        };

        let slot = if "Content-Type".eq_ignore_ascii_case(name) {
            &mut self.content_type
        } else if "Content-Transfer-Encoding".eq_ignore_ascii_case(name) {
            &mut self.transfer_encoding
        } else if "Content-Disposition".eq_ignore_ascii_case(name) {
            &mut self.disposition
        } else {
            return;
        };

        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn multipart<'a, 'b>(entity: &'b MimeEntity<'a>) -> &'b Multipart<'a> {
        match entity.body {
            EntityBody::Multipart(ref mp) => mp,
            ref body => panic!("Not multipart: {:?}", body),
        }
    }

    #[test]
    fn plain_message() {
        let message = b"From: alice@example.com\n\
                        Subject: hi\n\
                        \n\
                        Hello";
        let entity = parse(message).unwrap();
        assert_eq!(
            &b"From: alice@example.com\nSubject: hi\n"[..],
            entity.header
        );
        assert_eq!(&b"Hello"[..], entity.raw_body);
        assert_eq!("text/plain", entity.content_type);
        assert_eq!(None, entity.charset);
        assert_eq!(TransferEncoding::Identity, entity.transfer_encoding);
        assert_eq!(None, entity.disposition);
        assert_eq!(EntityBody::TextLeaf, entity.body);
    }

    #[test]
    fn headers_only() {
        let entity = parse(b"Subject: nothing\r\n").unwrap();
        assert_eq!(&b"Subject: nothing\r\n"[..], entity.header);
        assert!(entity.raw_body.is_empty());
    }

    #[test]
    fn leaf_attributes() {
        let message = b"Content-Type: TEXT/HTML;\r\n\tcharset=\"ISO-8859-1\"\r\n\
                        Content-Transfer-Encoding: Quoted-Printable\r\n\
                        Content-Disposition: INLINE\r\n\
                        Content-Type: text/plain\r\n\
                        \r\n\
                        <p>hi</p>\r\n";
        let entity = parse(message).unwrap();
        assert_eq!("text/html", entity.content_type);
        assert_eq!(Some("iso-8859-1"), entity.charset.as_deref());
        assert_eq!(
            TransferEncoding::QuotedPrintable,
            entity.transfer_encoding
        );
        assert_eq!(Some("inline"), entity.disposition.as_deref());
        assert_eq!(&b"<p>hi</p>\r\n"[..], entity.raw_body);
        assert_eq!(EntityBody::TextLeaf, entity.body);
    }

    #[test]
    fn unknown_transfer_encoding_is_opaque() {
        let entity =
            parse(b"Content-Transfer-Encoding: x-uuencode\n\nbegin 644\n")
                .unwrap();
        assert_eq!("text/plain", entity.content_type);
        assert_eq!(EntityBody::BinaryLeaf, entity.body);
    }

    #[test]
    fn multipart_structure() {
        let message = b"Content-Type: multipart/mixed; boundary=XYZ\n\
                        \n\
                        preamble\n\
                        --XYZ\n\
                        Content-Type: text/plain\n\
                        \n\
                        Hello\n\
                        \n\
                        --XYZ \n\
                        Content-Type: application/pdf\n\
                        Content-Disposition: attachment; filename=a.pdf\n\
                        Content-Transfer-Encoding: base64\n\
                        \n\
                        JVBERi0xLjQK\n\
                        --XYZ--\n\
                        epilogue\n";
        let entity = parse(message).unwrap();
        assert_eq!("multipart/mixed", entity.content_type);
        let mp = multipart(&entity);
        assert_eq!(b"XYZ".to_vec(), mp.boundary);
        assert_eq!(Some(&b"preamble"[..]), mp.preamble);
        assert_eq!(Some(&b"epilogue\n"[..]), mp.epilogue);
        assert_eq!(2, mp.children.len());

        let text = &mp.children[0];
        assert_eq!(&b"Content-Type: text/plain\n"[..], text.header);
        assert_eq!(&b"Hello\n"[..], text.raw_body);
        assert_eq!(EntityBody::TextLeaf, text.body);

        let pdf = &mp.children[1];
        assert_eq!("application/pdf", pdf.content_type);
        assert_eq!(Some("attachment"), pdf.disposition.as_deref());
        assert_eq!(TransferEncoding::Base64, pdf.transfer_encoding);
        assert_eq!(&b"JVBERi0xLjQK"[..], pdf.raw_body);
        assert_eq!(EntityBody::BinaryLeaf, pdf.body);
    }

    #[test]
    fn multipart_with_dos_line_endings() {
        let message = b"Content-Type: multipart/alternative; boundary=\"b\"\r\n\
                        \r\n\
                        --b\r\n\
                        \r\n\
                        plain\r\n\
                        --b\r\n\
                        Content-Type: text/html\r\n\
                        \r\n\
                        <b>html</b>\r\n\
                        --b--\r\n";
        let entity = parse(message).unwrap();
        let mp = multipart(&entity);
        assert_eq!(None, mp.preamble);
        assert_eq!(None, mp.epilogue);
        assert_eq!(2, mp.children.len());
        assert!(mp.children[0].header.is_empty());
        assert_eq!(&b"plain"[..], mp.children[0].raw_body);
        assert_eq!("text/plain", mp.children[0].content_type);
        assert_eq!(&b"<b>html</b>"[..], mp.children[1].raw_body);
    }

    #[test]
    fn nested_boundary_sharing_prefix() {
        let message = b"Content-Type: multipart/mixed; boundary=b\n\
                        \n\
                        --b\n\
                        Content-Type: multipart/alternative; boundary=b-inner\n\
                        \n\
                        --b-inner\n\
                        \n\
                        one\n\
                        --b-inner\n\
                        \n\
                        two\n\
                        --b-inner--\n\
                        --b\n\
                        \n\
                        three\n\
                        --b--\n";
        let entity = parse(message).unwrap();
        let outer = multipart(&entity);
        assert_eq!(2, outer.children.len());

        let inner = multipart(&outer.children[0]);
        assert_eq!(2, inner.children.len());
        assert_eq!(&b"one"[..], inner.children[0].raw_body);
        assert_eq!(&b"two"[..], inner.children[1].raw_body);
        assert_eq!(&b"three"[..], outer.children[1].raw_body);
    }

    #[test]
    fn embedded_message_and_digest() {
        let message = b"Content-Type: multipart/digest; boundary=d\n\
                        \n\
                        --d\n\
                        \n\
                        Subject: inner\n\
                        \n\
                        body\n\
                        --d--\n";
        let entity = parse(message).unwrap();
        let mp = multipart(&entity);
        let child = &mp.children[0];
        assert_eq!("message/rfc822", child.content_type);
        match child.body {
            EntityBody::Message(ref inner) => {
                assert_eq!(&b"Subject: inner\n"[..], inner.header);
                assert_eq!(&b"body"[..], inner.raw_body);
                assert_eq!(EntityBody::TextLeaf, inner.body);
            },
            ref body => panic!("Unexpected body: {:?}", body),
        }
    }

    #[test]
    fn missing_close_delimiter_is_tolerated() {
        let message = b"Content-Type: multipart/mixed; boundary=b\n\
                        \n\
                        --b\n\
                        \n\
                        last part\n";
        let entity = parse(message).unwrap();
        let mp = multipart(&entity);
        assert_eq!(1, mp.children.len());
        assert_eq!(&b"last part\n"[..], mp.children[0].raw_body);
        assert_eq!(None, mp.epilogue);
    }

    #[test]
    fn malformed_multipart_is_an_error() {
        assert_eq!(
            Err(ParseError::MissingBoundary("multipart/mixed".to_owned())),
            parse(b"Content-Type: multipart/mixed\n\nbody\n")
        );
        assert_eq!(
            Err(ParseError::NoDelimiter),
            parse(b"Content-Type: multipart/mixed; boundary=q\n\nbody\n")
        );
    }

    #[test]
    fn excessive_nesting_is_an_error() {
        let mut message = Vec::new();
        for depth in 0..=MAX_RECURSION {
            message.extend_from_slice(
                format!(
                    "Content-Type: multipart/mixed; boundary=b{}\n\n--b{}\n",
                    depth, depth
                )
                .as_bytes(),
            );
        }
        message.extend_from_slice(b"\ninnermost\n");

        assert_eq!(Err(ParseError::TooDeep), parse(&message));
    }
}
