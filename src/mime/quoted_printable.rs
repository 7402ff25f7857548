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
use std::str;

/// Maximum length of an encoded line, not counting the line ending.
const MAX_LINE: usize = 76;

/// Decodes quoted-printable encoding, as described by RFC 2045.
///
/// Encoded bytes and soft line endings are both handled, the latter by
/// discarding. UNIX line endings are handled as well as DOS line endings.
///
/// This never fails. Invalid sequences are passed through untransformed.
/// Certain restrictions, such as not having trailing whitespace on a line, are
/// not enforced, and are passed through. 8-bit characters are passed through,
/// including invalid UTF-8.
///
/// Returns the decoded text, as well as a possible "dangling" slice, which
/// represents a QP escape sequence that is not yet complete.
pub fn qp_decode(s: &[u8]) -> (Cow<[u8]>, &[u8]) {
    let mut transformed = Vec::new();
    let mut modified = false;
    let mut dangling: Option<&[u8]> = None;

    let mut split = s.split(|&b| b'=' == b);
    let mut prefix = split.next();

    for element in split {
        modified = true;
        if let Some(prefix) = prefix.take() {
            transformed.extend_from_slice(prefix);
        }

        if let Some(dangling) = dangling.take() {
            transformed.push(b'=');
            transformed.extend_from_slice(dangling);
        }

        if element.is_empty() {
            dangling = Some(element);
            continue;
        }

        if b'\n' == element[0] {
            // Soft line break with UNIX ending, discard
            transformed.extend_from_slice(&element[1..]);
            continue;
        }

        // All other = sequences are two bytes long
        if element.len() < 2 {
            dangling = Some(element);
            continue;
        }

        let encoded = &element[..2];
        let tail = &element[2..];
        if b"\r\n" == encoded {
            // Soft line break with DOS ending, discard
            transformed.extend_from_slice(tail);
            continue;
        }

        if let Some(ch) = str::from_utf8(encoded)
            .ok()
            .and_then(|e| u8::from_str_radix(e, 16).ok())
        {
            // Valid encoded byte
            transformed.push(ch);
            transformed.extend_from_slice(tail);
        } else {
            // Invalid encoding, just push the whole string verbatim
            transformed.push(b'=');
            transformed.extend_from_slice(element);
        }
    }

    if !modified {
        (Cow::Borrowed(s), &[])
    } else {
        (
            Cow::Owned(transformed),
            dangling.map(|d| &s[s.len() - d.len() - 1..]).unwrap_or(&[]),
        )
    }
}

/// Encodes `s` with the strict flavour of quoted-printable.
///
/// Only printable ASCII other than `=` is written literally. Every other byte,
/// including CR and LF, is escaped, so decoding always reproduces the input
/// exactly regardless of how the transport treats line endings. Spaces and
/// tabs are literal except at the very end of the output. Lines are wrapped
/// with soft line breaks so that no line exceeds 76 characters.
pub fn qp_encode(s: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut out = Vec::with_capacity(s.len() + s.len() / 2);
    let mut column = 0;

    for (ix, &byte) in s.iter().enumerate() {
        let last = ix + 1 == s.len();
        let literal = match byte {
            b'=' => false,
            b' ' | b'\t' => !last,
            33..=126 => true,
            _ => false,
        };

        let width = if literal { 1 } else { 3 };
        // Leave room for the `=` of a soft line break
        if column + width > MAX_LINE - 1 {
            out.extend_from_slice(b"=\r\n");
            column = 0;
        }

        if literal {
            out.push(byte);
        } else {
            out.push(b'=');
            out.push(HEX[(byte >> 4) as usize]);
            out.push(HEX[(byte & 0xF) as usize]);
        }
        column += width;
    }

    out
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn assert_qp(expected: &[u8], expected_dangling: &[u8], input: &[u8]) {
        let (actual, actual_dangling) = qp_decode(input);
        assert_eq!(expected, &actual[..]);
        assert_eq!(expected_dangling, actual_dangling);
    }

    #[test]
    fn test_qp_decode() {
        assert_qp(b"hello world", b"", b"hello world");
        assert_qp(b"\xabfoo", b"", b"=ABfoo");
        assert_qp(b"fo\xabo", b"", b"fo=ABo");
        assert_qp(b"foo\xab", b"", b"foo=AB");

        assert_qp(b"foo\xab\xcd", b"", b"foo=AB=CD");
        assert_qp(b"foo\xabbar\xcd", b"", b"foo=ABbar=CD");

        assert_qp(b"foo", b"", b"foo=\n");
        assert_qp(b"foobar", b"", b"foo=\nbar");
        assert_qp(b"foo", b"", b"foo=\r\n");
        assert_qp(b"foobar", b"", b"foo=\r\nbar");
        assert_qp(b"", b"", b"=\r\n");

        assert_qp(b"foo=()bar", b"", b"foo=()bar");
        assert_qp(b"foo=\xabbar", b"", b"foo==ABbar");
        assert_qp(b"foo=A\xabbar", b"", b"foo=A=ABbar");
        assert_qp("foo=ゑbar".as_bytes(), b"", "foo=ゑbar".as_bytes());
        assert_qp(b"foo=\x80\x80bar", b"", b"foo=\x80\x80bar");

        assert_qp(b"foo", b"=", b"foo=");
        assert_qp(b"foo", b"=A", b"foo=A");
        assert_qp(b"foo", b"=\r", b"foo=\r");
    }

    #[test]
    fn test_qp_encode() {
        assert_eq!(b"hello world".to_vec(), qp_encode(b"hello world"));
        assert_eq!(b"a=3Db".to_vec(), qp_encode(b"a=b"));
        assert_eq!(b"Gr=C3=BC=C3=9Fe".to_vec(), qp_encode("Grüße".as_bytes()));
        assert_eq!(b"line=0D=0Anext=0A".to_vec(), qp_encode(b"line\r\nnext\n"));
        assert_eq!(b"trailing =20".to_vec(), qp_encode(b"trailing  "));
        assert_eq!(b"tab=09".to_vec(), qp_encode(b"tab\t"));
    }

    #[test]
    fn qp_encode_wraps_long_lines() {
        let input = vec![b'x'; 200];
        let encoded = qp_encode(&input);
        for line in encoded.split(|&b| b'\n' == b) {
            assert!(line.len() <= MAX_LINE + 1, "too long: {:?}", line);
        }
        assert_eq!(input, qp_decode(&encoded).0.into_owned());
    }

    proptest! {
        #[test]
        fn qp_decode_never_fails_for_str(s in ".*") {
            qp_decode(s.as_bytes());
        }

        #[test]
        fn qp_decode_never_fails_for_bytes(
            s in prop::collection::vec(prop::num::u8::ANY, 0..20)
        ) {
            qp_decode(&s);
        }

        #[test]
        fn qp_encode_is_reversible(
            s in prop::collection::vec(prop::num::u8::ANY, 0..300)
        ) {
            let encoded = qp_encode(&s);
            let (decoded, dangling) = qp_decode(&encoded);
            prop_assert_eq!(&s[..], &decoded[..]);
            prop_assert!(dangling.is_empty());
            prop_assert!(encoded.iter().all(|&b| b < 0x80));
        }
    }
}
