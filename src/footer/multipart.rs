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

//! Re-serialisation of a parsed message with footers spliced into its
//! leaves.

use log::{info, warn};

use super::leaf::{self, FooterKind, LINE_BREAK};
use crate::mime::model::{EntityBody, MimeEntity, Multipart};
use crate::support::log_prefix::LogPrefix;

/// The footer texts selected for the sender of the message.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectedFooters<'f> {
    pub text: Option<&'f str>,
    pub html: Option<&'f str>,
}

/// Rebuilds the body of one message.
///
/// Any signed or encrypted entity encountered along the way clears
/// `footer_available` for good: no leaf rendered afterwards gets a footer,
/// and the caller must discard the result.
pub struct Reconstructor<'r> {
    footers: SelectedFooters<'r>,
    log_prefix: &'r LogPrefix,
    footer_available: bool,
    footers_inserted: usize,
}

impl<'r> Reconstructor<'r> {
    pub fn new(
        footers: SelectedFooters<'r>,
        log_prefix: &'r LogPrefix,
    ) -> Self {
        Reconstructor {
            footers,
            log_prefix,
            footer_available: true,
            footers_inserted: 0,
        }
    }

    pub fn footer_available(&self) -> bool {
        self.footer_available
    }

    pub fn footers_inserted(&self) -> usize {
        self.footers_inserted
    }

    /// Render the body of `root`, i.e. everything after its header block.
    pub fn render_message(&mut self, root: &MimeEntity<'_>) -> Vec<u8> {
        let mut out = Vec::with_capacity(root.raw_body.len() + 1024);
        self.check_guard(root);
        self.render_body(root, true, &mut out);
        out
    }

    fn render_body(
        &mut self,
        entity: &MimeEntity<'_>,
        is_root: bool,
        out: &mut Vec<u8>,
    ) {
        match entity.body {
            EntityBody::Multipart(ref multipart) => {
                self.render_multipart(multipart, is_root, out)
            },
            EntityBody::Message(ref inner) if !entity.is_attachment() => {
                self.check_guard(inner);
                out.extend_from_slice(inner.header);
                out.extend_from_slice(LINE_BREAK);
                self.render_body(inner, false, out);
            },
            EntityBody::Message(_)
            | EntityBody::TextLeaf
            | EntityBody::BinaryLeaf => self.render_leaf(entity, out),
        }
    }

    fn render_multipart(
        &mut self,
        multipart: &Multipart<'_>,
        is_root: bool,
        out: &mut Vec<u8>,
    ) {
        // The root's preamble and epilogue are only there for the benefit of
        // non-MIME readers and are not carried over
        if let (false, Some(preamble)) = (is_root, multipart.preamble) {
            out.extend_from_slice(preamble);
            out.extend_from_slice(LINE_BREAK);
        }

        for child in &multipart.children {
            self.check_guard(child);

            out.extend_from_slice(b"--");
            out.extend_from_slice(&multipart.boundary);
            out.extend_from_slice(LINE_BREAK);
            out.extend_from_slice(child.header);
            out.extend_from_slice(LINE_BREAK);
            self.render_body(child, false, out);
            // A nested multipart already ends with blank lines
            if !matches!(child.body, EntityBody::Multipart(_)) {
                out.extend_from_slice(LINE_BREAK);
            }
        }

        out.extend_from_slice(LINE_BREAK);
        out.extend_from_slice(b"--");
        out.extend_from_slice(&multipart.boundary);
        out.extend_from_slice(b"--");
        out.extend_from_slice(LINE_BREAK);
        out.extend_from_slice(LINE_BREAK);

        if let (false, Some(epilogue)) = (is_root, multipart.epilogue) {
            out.extend_from_slice(epilogue);
            out.extend_from_slice(LINE_BREAK);
        }
    }

    fn render_leaf(&mut self, entity: &MimeEntity<'_>, out: &mut Vec<u8>) {
        let footer = match leaf::footer_kind(entity) {
            _ if !self.footer_available => None,
            Some(FooterKind::Text) => self.footers.text,
            Some(FooterKind::Html) => self.footers.html,
            None => None,
        };

        match leaf::render(entity, footer) {
            Ok(rendered) => {
                if footer.is_some() {
                    self.footers_inserted += 1;
                }
                out.extend_from_slice(&rendered);
            },
            Err(e) => {
                warn!(
                    "{} Leaving {} part without footer: {}",
                    self.log_prefix, entity.content_type, e
                );
                out.extend_from_slice(entity.raw_body);
            },
        }
    }

    fn check_guard(&mut self, entity: &MimeEntity<'_>) {
        if self.footer_available && entity.is_signed_or_encrypted() {
            info!(
                "{} Message contains {}, not adding a footer",
                self.log_prefix, entity.content_type
            );
            self.footer_available = false;
        }
    }
}
