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

//! Parsers for the few structured header fields that matter when rewriting a
//! message body, plus the address syntax used for envelope senders.

use std::borrow::Cow;

use nom::{
    branch::alt,
    bytes::complete::{is_a, is_not, take, take_while1},
    character::complete::char,
    combinator::{map, opt},
    multi::{fold_many0, many0, many0_count, separated_nonempty_list},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::model::AddrSpec;

type PResult<'a, T> = IResult<&'a [u8], T>;

/// A parsed `Content-Type` header.
///
/// Parameter names are kept as they appear; use `parm()` for
/// case-insensitive lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType<'a> {
    pub typ: &'a [u8],
    pub subtype: &'a [u8],
    pub parms: Vec<(&'a [u8], Cow<'a, [u8]>)>,
}

impl<'a> ContentType<'a> {
    pub fn parm(&self, name: &str) -> Option<&[u8]> {
        self.parms
            .iter()
            .find(|&&(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| &v[..])
    }
}

/// A parsed `Content-Disposition` header.
///
/// Only the disposition type matters for deciding what takes a footer, so
/// parameters are consumed but not kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDisposition<'a> {
    pub disposition: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentTransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    QuotedPrintable,
    Base64,
}

impl Default for ContentTransferEncoding {
    fn default() -> Self {
        ContentTransferEncoding::SevenBit
    }
}

/// Parse the value of a `Content-Type` header.
pub fn parse_content_type(value: &[u8]) -> Option<ContentType<'_>> {
    content_type(value).ok().map(|(_, ct)| ct)
}

/// Parse the value of a `Content-Transfer-Encoding` header.
///
/// Returns `None` for syntax errors and encodings not defined by RFC 2045.
pub fn parse_content_transfer_encoding(
    value: &[u8],
) -> Option<ContentTransferEncoding> {
    content_transfer_encoding(value).ok().and_then(|(_, cte)| cte)
}

/// Parse the value of a `Content-Disposition` header.
pub fn parse_content_disposition(
    value: &[u8],
) -> Option<ContentDisposition<'_>> {
    content_disposition(value).ok().map(|(_, cd)| cd)
}

/// Parse an envelope sender, either bare (`user@host`) or angle-delimited
/// (`<user@host>`) as in the SMTP `MAIL FROM` command.
///
/// The null sender `<>` and anything with trailing garbage yield `None`.
pub fn parse_envelope_sender(value: &[u8]) -> Option<AddrSpec<'_>> {
    alt((angle_addr, terminated(addr_spec, opt(cfws))))(value)
        .ok()
        .filter(|(rest, _)| rest.is_empty())
        .map(|(_, addr)| addr)
}

// RFC 2822 3.2.2 "quoted-pair", including the 8-bit clean "obsolete" syntax
fn quoted_pair(i: &[u8]) -> PResult<'_, &[u8]> {
    preceded(char('\\'), take(1usize))(i)
}

// RFC 2822 3.2.3 "Folding white space".
// Unfolding never happens before these parsers run, so the line-ending
// characters are just more whitespace.
fn fws(i: &[u8]) -> PResult<'_, &[u8]> {
    map(is_a(" \t\r\n"), |_| &b" "[..])(i)
}

// RFC 2822 3.2.3 "Comment text".
fn ctext(i: &[u8]) -> PResult<'_, &[u8]> {
    is_not("()\\ \t\r\n")(i)
}

// RFC 2822 3.2.3 "Comment content".
fn ccontent(i: &[u8]) -> PResult<'_, ()> {
    alt((
        map(ctext, |_| ()),
        map(quoted_pair, |_| ()),
        map(fws, |_| ()),
        comment,
    ))(i)
}

// RFC 2822 3.2.3 "Comment". Note it is recursive.
fn comment(i: &[u8]) -> PResult<'_, ()> {
    delimited(char('('), map(many0_count(ccontent), |_| ()), char(')'))(i)
}

// RFC 2822 3.2.3 "Comment or folding white space".
fn cfws(i: &[u8]) -> PResult<'_, ()> {
    map(many0_count(alt((map(fws, |_| ()), comment))), |_| ())(i)
}

// RFC 2822 3.2.4 "Atom text"
// Amended by RFC 6532 to include all non-ASCII characters
fn is_atext(ch: u8) -> bool {
    ch.is_ascii_alphanumeric()
        || b"!#$%&'*+-/=?^_`{|}~".contains(&ch)
        || ch >= 0x80
}

fn atom(i: &[u8]) -> PResult<'_, &[u8]> {
    delimited(opt(cfws), take_while1(is_atext), opt(cfws))(i)
}

// RFC 2045 5.1 "token"
fn is_token_char(ch: u8) -> bool {
    ch > b' ' && ch < 0x7F && !b"()<>@,;:\\\"/[]?=".contains(&ch)
}

fn token(i: &[u8]) -> PResult<'_, &[u8]> {
    take_while1(is_token_char)(i)
}

// RFC 2822 3.2.5 "Quoted [string] text"
fn qtext(i: &[u8]) -> PResult<'_, &[u8]> {
    is_not(" \t\r\n\\\"")(i)
}

// RFC 2822 3.2.5 "Quoted [string] content"
fn qcontent(i: &[u8]) -> PResult<'_, &[u8]> {
    alt((qtext, quoted_pair, fws))(i)
}

// RFC 2822 3.2.5 "Quoted string"
fn quoted_string(i: &[u8]) -> PResult<'_, Cow<'_, [u8]>> {
    delimited(
        pair(opt(cfws), char('"')),
        fold_many0(qcontent, Cow::Borrowed(&[] as &[u8]), |mut acc, item| {
            if acc.is_empty() {
                acc = Cow::Borrowed(item);
            } else {
                acc.to_mut().extend_from_slice(item);
            }
            acc
        }),
        pair(char('"'), opt(cfws)),
    )(i)
}

// RFC 2822 3.2.6 "word"
fn word(i: &[u8]) -> PResult<'_, Cow<'_, [u8]>> {
    alt((map(atom, Cow::Borrowed), quoted_string))(i)
}

// RFC 2045 5.1 "value", made lenient towards the unquoted `=` that some
// agents put into boundaries.
fn parameter_value(i: &[u8]) -> PResult<'_, Cow<'_, [u8]>> {
    alt((
        quoted_string,
        map(terminated(is_not("; \t\r\n\"()"), opt(cfws)), Cow::Borrowed),
    ))(i)
}

// RFC 2045 5.1 "parameter", preceded by its `;`.
// Malformed parameters are skipped up to the next `;`.
fn parameter(i: &[u8]) -> PResult<'_, Option<(&[u8], Cow<'_, [u8]>)>> {
    preceded(
        pair(char(';'), opt(cfws)),
        alt((
            map(
                pair(
                    terminated(
                        token,
                        tuple((opt(cfws), char('='), opt(cfws))),
                    ),
                    parameter_value,
                ),
                Some,
            ),
            map(opt(is_not(";")), |_| None),
        )),
    )(i)
}

// RFC 2045 5.1 Content-Type
fn content_type(i: &[u8]) -> PResult<'_, ContentType<'_>> {
    map(
        tuple((
            opt(cfws),
            token,
            opt(cfws),
            char('/'),
            opt(cfws),
            token,
            opt(cfws),
            many0(parameter),
        )),
        |(_, typ, _, _, _, subtype, _, parms)| ContentType {
            typ,
            subtype,
            parms: parms.into_iter().flatten().collect(),
        },
    )(i)
}

// RFC 2045 6.1 Content-Transfer-Encoding
fn content_transfer_encoding(
    i: &[u8],
) -> PResult<'_, Option<ContentTransferEncoding>> {
    use self::ContentTransferEncoding as CTE;

    map(delimited(opt(cfws), token, opt(cfws)), |name: &[u8]| {
        match &name.to_ascii_lowercase()[..] {
            b"7bit" => Some(CTE::SevenBit),
            b"8bit" => Some(CTE::EightBit),
            b"binary" => Some(CTE::Binary),
            b"quoted-printable" => Some(CTE::QuotedPrintable),
            b"base64" => Some(CTE::Base64),
            _ => None,
        }
    })(i)
}

// RFC 2183 Content-Disposition
fn content_disposition(i: &[u8]) -> PResult<'_, ContentDisposition<'_>> {
    map(
        tuple((opt(cfws), token, opt(cfws), many0(parameter))),
        |(_, disposition, _, _)| ContentDisposition { disposition },
    )(i)
}

// RFC 2822 3.4.1 local part of address
// Formally, this is `dot-atom / quoted-string / obs-local-part`, with
// `obs-local-part` being `word *("." word)`. Any dot-atom or quoted-string
// conforms to obs-local-part, so we just parse that.
fn local_part(i: &[u8]) -> PResult<'_, Vec<Cow<'_, [u8]>>> {
    separated_nonempty_list(char('.'), word)(i)
}

// RFC 2822 4.4 obsolete domain format
fn obs_domain(i: &[u8]) -> PResult<'_, Vec<Cow<'_, [u8]>>> {
    separated_nonempty_list(char('.'), map(atom, Cow::Borrowed))(i)
}

// RFC 2822 3.4.1 domain name text
// Amended by RFC 6532 to include all non-ASCII
fn dtext(i: &[u8]) -> PResult<'_, &[u8]> {
    is_not("[]\\ \t\r\n")(i)
}

// RFC 2822 3.4.1 domain literal content
fn dcontent(i: &[u8]) -> PResult<'_, &[u8]> {
    alt((dtext, quoted_pair, fws))(i)
}

// RFC 2822 3.4.1 domain literal
fn domain_literal(i: &[u8]) -> PResult<'_, Vec<u8>> {
    map(
        delimited(
            pair(opt(cfws), char('[')),
            fold_many0(dcontent, vec![b'['], |mut acc, item| {
                acc.extend_from_slice(item);
                acc
            }),
            pair(char(']'), opt(cfws)),
        ),
        |mut res| {
            res.push(b']');
            res
        },
    )(i)
}

// RFC 2822 3.4.1 domain
// dot-atom is encompassed by obs_domain
fn domain(i: &[u8]) -> PResult<'_, Vec<Cow<'_, [u8]>>> {
    alt((obs_domain, map(domain_literal, |v| vec![Cow::Owned(v)])))(i)
}

// RFC 2822 3.4.1 address specification
fn addr_spec(i: &[u8]) -> PResult<'_, AddrSpec<'_>> {
    map(
        pair(local_part, preceded(char('@'), domain)),
        |(local, domain)| AddrSpec { local, domain },
    )(i)
}

// RFC 2822 4.4 obsolete routing information, which is discarded
fn obs_route(i: &[u8]) -> PResult<'_, ()> {
    map(
        tuple((
            char('@'),
            domain,
            many0_count(tuple((char(','), opt(cfws), char('@'), domain))),
            char(':'),
        )),
        |_| (),
    )(i)
}

// RFC 2822 3.4 angle-delimited address, including the 4.4 obsolete routing
// information.
fn angle_addr(i: &[u8]) -> PResult<'_, AddrSpec<'_>> {
    delimited(
        tuple((opt(cfws), char('<'), opt(obs_route))),
        addr_spec,
        pair(char('>'), opt(cfws)),
    )(i)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_type_parsing() {
        let ct = parse_content_type(
            b"multipart/mixed; boundary=\"=_abc 123\"; charset=UTF-8",
        )
        .unwrap();
        assert_eq!(&b"multipart"[..], ct.typ);
        assert_eq!(&b"mixed"[..], ct.subtype);
        assert_eq!(Some(&b"=_abc 123"[..]), ct.parm("Boundary"));
        assert_eq!(Some(&b"UTF-8"[..]), ct.parm("charset"));
        assert_eq!(None, ct.parm("name"));

        let ct = parse_content_type(
            b" text/plain (comment)\r\n\t;charset = iso-8859-1 ;",
        )
        .unwrap();
        assert_eq!(&b"text"[..], ct.typ);
        assert_eq!(&b"plain"[..], ct.subtype);
        assert_eq!(Some(&b"iso-8859-1"[..]), ct.parm("charset"));

        assert_eq!(None, parse_content_type(b"text"));
        assert_eq!(None, parse_content_type(b""));
    }

    #[test]
    fn content_type_tolerates_bad_parameters() {
        let ct = parse_content_type(
            b"multipart/alternative; garbage; boundary=----=_Part_7_1.2",
        )
        .unwrap();
        assert_eq!(Some(&b"----=_Part_7_1.2"[..]), ct.parm("boundary"));
    }

    #[test]
    fn content_transfer_encoding_parsing() {
        use super::ContentTransferEncoding as CTE;

        assert_eq!(
            Some(CTE::Base64),
            parse_content_transfer_encoding(b" BASE64\r\n")
        );
        assert_eq!(
            Some(CTE::QuotedPrintable),
            parse_content_transfer_encoding(b"quoted-printable")
        );
        assert_eq!(
            Some(CTE::SevenBit),
            parse_content_transfer_encoding(b"7bit (plain)")
        );
        assert_eq!(None, parse_content_transfer_encoding(b"x-uuencode"));
        assert_eq!(None, parse_content_transfer_encoding(b""));
    }

    #[test]
    fn content_disposition_parsing() {
        let cd =
            parse_content_disposition(b"Attachment; filename=\"a b.pdf\"")
                .unwrap();
        assert_eq!(&b"Attachment"[..], cd.disposition);

        let cd = parse_content_disposition(b"inline").unwrap();
        assert_eq!(&b"inline"[..], cd.disposition);

        assert_eq!(None, parse_content_disposition(b"; filename=x"));
    }

    #[test]
    fn envelope_sender_parsing() {
        assert_eq!(
            "alice@example.com",
            parse_envelope_sender(b"<alice@example.com>")
                .unwrap()
                .to_string()
        );
        assert_eq!(
            "bob.smith@mail.example.org",
            parse_envelope_sender(b"bob.smith@mail.example.org")
                .unwrap()
                .to_string()
        );
        assert_eq!(
            "carol@example.net",
            parse_envelope_sender(b"<@relay.example:carol@example.net>")
                .unwrap()
                .to_string()
        );
        assert_eq!(None, parse_envelope_sender(b"<>"));
        assert_eq!(None, parse_envelope_sender(b"postmaster"));
        assert_eq!(None, parse_envelope_sender(b"<a@b> junk"));
    }
}
