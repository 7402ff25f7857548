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

//! The per-connection state machine which collects a message and decides
//! whether and how to rewrite it.

use std::sync::Arc;

use log::{debug, info, warn};

use super::leaf::LINE_BREAK;
use super::mapping::{FooterCatalog, FooterMappings};
use super::multipart::{Reconstructor, SelectedFooters};
use super::resolver::{self, ResolvedSender};
use crate::mime::parser;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::MilterConfig;

/// A change to the current message requested at its end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modification {
    ReplaceBody(Vec<u8>),
    AddHeader { name: String, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No connection information yet, or reset for a new connection.
    Idle,
    /// Between messages.
    Connected,
    /// The envelope sender of a message has been resolved.
    SenderKnown,
    /// Header or body data of the message is being received.
    Accumulating,
}

/// Everything which must not outlive a single message.
#[derive(Default)]
struct MessageState {
    sender: String,
    mappings: Arc<FooterMappings>,
    resolved: ResolvedSender,
    header_bytes: Vec<u8>,
    body_bytes: Vec<u8>,
}

pub struct FooterSession {
    catalog: Arc<FooterCatalog>,
    config: Arc<MilterConfig>,
    log_prefix: LogPrefix,
    daemon: String,
    state: SessionState,
    message: MessageState,
}

impl FooterSession {
    pub fn new(
        catalog: Arc<FooterCatalog>,
        config: Arc<MilterConfig>,
        log_prefix: LogPrefix,
    ) -> Self {
        let daemon = config.daemon_name.clone();
        FooterSession {
            catalog,
            config,
            log_prefix,
            daemon,
            state: SessionState::Idle,
            message: MessageState::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A new SMTP client connected to the MTA.
    ///
    /// `daemon` is the MTA's name for itself, if it told us.
    pub fn on_connect(&mut self, daemon: Option<&str>) {
        if let Some(daemon) = daemon.filter(|d| !d.is_empty()) {
            self.daemon = daemon.to_owned();
            self.log_prefix.set_daemon(daemon.to_owned());
        }

        self.message = MessageState::default();
        self.state = SessionState::Connected;
    }

    /// The envelope sender of a new message is known.
    ///
    /// Anything left over from a message that never reached its end is
    /// discarded.
    pub fn on_sender_known(&mut self, sender: &str) {
        self.log_prefix.set_sender(sender.to_owned());

        let mappings = self.catalog.snapshot();
        let resolved =
            resolver::resolve(sender, &mappings.text, &mappings.html);
        match resolved.tier {
            Some(tier) => info!(
                "{} Footer available ({:?} match; text={:?} html={:?})",
                self.log_prefix, tier, resolved.text_key, resolved.html_key
            ),
            None => debug!("{} No footer for sender", self.log_prefix),
        }

        self.message = MessageState {
            sender: sender.to_owned(),
            mappings,
            resolved,
            header_bytes: Vec::new(),
            body_bytes: Vec::new(),
        };
        self.state = SessionState::SenderKnown;
    }

    pub fn on_header(&mut self, name: &[u8], value: &[u8]) {
        self.state = SessionState::Accumulating;
        self.accumulate(false, &[name, &b": "[..], value, LINE_BREAK]);
    }

    pub fn on_end_of_headers(&mut self) {
        self.state = SessionState::Accumulating;
    }

    pub fn on_body_chunk(&mut self, chunk: &[u8]) {
        self.state = SessionState::Accumulating;
        self.accumulate(true, &[chunk]);
    }

    /// The MTA abandoned the current message.
    ///
    /// Nothing is done here; the next message or connection starts from a
    /// clean state regardless.
    pub fn on_abort(&mut self) {
        debug!("{} Message aborted by MTA", self.log_prefix);
    }

    /// The whole message has been received.
    ///
    /// Returns the modifications to apply to it, which are either nothing at
    /// all or a replacement body and an added header. The session is ready
    /// for the next message afterwards, whatever the outcome.
    pub fn on_end_of_message(&mut self) -> Vec<Modification> {
        let modifications = self.finish_message();

        self.message = MessageState::default();
        self.state = SessionState::Connected;
        self.log_prefix.clear_message();
        self.catalog.refresh(&self.log_prefix);

        modifications
    }

    /// Forget everything about the current SMTP connection.
    pub fn reset(&mut self) {
        self.message = MessageState::default();
        self.daemon = self.config.daemon_name.clone();
        self.state = SessionState::Idle;
        self.log_prefix.clear_message();
    }

    fn accumulate(&mut self, into_body: bool, parts: &[&[u8]]) {
        if !self.message.resolved.footer_available {
            return;
        }

        let len = parts.iter().map(|p| p.len()).sum::<usize>();
        let total = self.message.header_bytes.len()
            + self.message.body_bytes.len()
            + len;
        if total > self.config.max_message_size {
            warn!(
                "{} Message exceeds {} bytes, not adding a footer",
                self.log_prefix, self.config.max_message_size
            );
            self.fail_closed();
            return;
        }

        let buffer = if into_body {
            &mut self.message.body_bytes
        } else {
            &mut self.message.header_bytes
        };
        if buffer.try_reserve(len).is_err() {
            warn!(
                "{} {}; not adding a footer",
                self.log_prefix,
                Error::BufferReservation(len)
            );
            self.fail_closed();
            return;
        }

        for part in parts {
            buffer.extend_from_slice(part);
        }
    }

    fn fail_closed(&mut self) {
        self.message.resolved.footer_available = false;
        self.message.header_bytes = Vec::new();
        self.message.body_bytes = Vec::new();
    }

    fn finish_message(&mut self) -> Vec<Modification> {
        let message = &mut self.message;
        if !message.resolved.footer_available {
            return vec![];
        }

        let mut data = Vec::new();
        let len = message.header_bytes.len()
            + LINE_BREAK.len()
            + message.body_bytes.len();
        if data.try_reserve_exact(len).is_err() {
            warn!(
                "{} {}; not adding a footer",
                self.log_prefix,
                Error::BufferReservation(len)
            );
            return vec![];
        }
        data.extend_from_slice(&message.header_bytes);
        data.extend_from_slice(LINE_BREAK);
        data.extend_from_slice(&message.body_bytes);
        message.header_bytes = Vec::new();
        message.body_bytes = Vec::new();

        let root = match parser::parse(&data) {
            Ok(root) => root,
            Err(e) => {
                warn!(
                    "{} Passing unparseable message through: {}",
                    self.log_prefix,
                    Error::from(e)
                );
                return vec![];
            },
        };

        let footers = SelectedFooters {
            text: message.resolved.text_footer(&message.mappings),
            html: message.resolved.html_footer(&message.mappings),
        };
        let mut reconstructor = Reconstructor::new(footers, &self.log_prefix);
        let body = reconstructor.render_message(&root);

        if !reconstructor.footer_available() {
            return vec![];
        }

        if 0 == reconstructor.footers_inserted() {
            info!("{} No part of the message takes a footer", self.log_prefix);
            return vec![];
        }

        info!(
            "{} Added footer to {} part(s)",
            self.log_prefix,
            reconstructor.footers_inserted()
        );
        vec![
            Modification::ReplaceBody(body),
            Modification::AddHeader {
                name: self.config.header_name.clone(),
                value: format!(
                    "Mail body modified (using footer)\nby {}\nfor <{}>",
                    self.daemon, message.sender
                ),
            },
        ]
    }
}
