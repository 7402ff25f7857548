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

//! Rendering of single leaf parts.

use std::borrow::Cow;

use crate::mime::content_encoding::{self, EncodingError, TransferEncoding};
use crate::mime::model::{EntityBody, MimeEntity};

/// The line break used for everything this crate generates.
pub const LINE_BREAK: &[u8] = b"\n";

const CLOSE_BODY: &[u8] = b"</body>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FooterKind {
    Text,
    Html,
}

/// Which kind of footer `entity` takes, if any.
///
/// Only inline `text/plain` and `text/html` leaves take footers.
pub fn footer_kind(entity: &MimeEntity<'_>) -> Option<FooterKind> {
    if !matches!(entity.body, EntityBody::TextLeaf) || entity.is_attachment()
    {
        return None;
    }

    if entity.is_subtype("plain") {
        Some(FooterKind::Text)
    } else if entity.is_subtype("html") {
        Some(FooterKind::Html)
    } else {
        None
    }
}

/// Render the body of the leaf `entity` with `footer` spliced in.
///
/// Parts which do not take a footer, and all parts when `footer` is `None`,
/// come back exactly as they were. Otherwise the body is decoded, the
/// footer (converted to the part's charset) is added, and the result is
/// re-encoded as a whole with the part's transfer encoding.
pub fn render<'a>(
    entity: &MimeEntity<'a>,
    footer: Option<&str>,
) -> Result<Cow<'a, [u8]>, EncodingError> {
    let (kind, footer) = match (footer_kind(entity), footer) {
        (Some(kind), Some(footer)) => (kind, footer),
        _ => return Ok(Cow::Borrowed(entity.raw_body)),
    };

    let charset = content_encoding::charset(entity.charset.as_deref())?;
    let footer = content_encoding::encode_text(footer, charset)?;
    let body = entity.transfer_encoding.decode(entity.raw_body)?;

    let spliced = match kind {
        FooterKind::Text => append_text_footer(&body, &footer),
        FooterKind::Html => splice_html_footer(&body, &footer),
    };

    if TransferEncoding::Identity == entity.transfer_encoding {
        Ok(Cow::Owned(spliced))
    } else {
        Ok(Cow::Owned(
            entity.transfer_encoding.encode(&spliced).into_owned(),
        ))
    }
}

fn append_text_footer(body: &[u8], footer: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(body.len() + footer.len() + 2 * LINE_BREAK.len());
    out.extend_from_slice(body);
    if !footer.is_empty() && !body.is_empty() && !body.ends_with(b"\n") {
        out.extend_from_slice(LINE_BREAK);
    }
    out.extend_from_slice(footer);
    out.extend_from_slice(LINE_BREAK);
    out
}

/// Put `footer` on its own line just before the first `</body>`, or at the
/// end of the document if there is none.
fn splice_html_footer(body: &[u8], footer: &[u8]) -> Vec<u8> {
    let split = memchr::memmem::find(body, CLOSE_BODY).unwrap_or(body.len());
    let (before, after) = body.split_at(split);

    let mut out = Vec::with_capacity(
        body.len() + footer.len() + 2 * LINE_BREAK.len(),
    );
    out.extend_from_slice(before);
    out.extend_from_slice(LINE_BREAK);
    out.extend_from_slice(footer);
    out.extend_from_slice(LINE_BREAK);
    out.extend_from_slice(after);
    out
}
