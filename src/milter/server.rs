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

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use log::{debug, info, warn};

use super::codec::{self, Actions, Command, Protocol, Response};
use crate::footer::mapping::FooterCatalog;
use crate::footer::session::{FooterSession, Modification};
use crate::mime::header::parse_envelope_sender;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::MilterConfig;

/// The modifications we may ask for.
fn wanted_actions() -> Actions {
    Actions::ADD_HEADERS | Actions::CHANGE_BODY
}

/// Protocol steps we have no interest in.
fn skipped_steps() -> Protocol {
    Protocol::NO_HELO
        | Protocol::NO_RCPT
        | Protocol::NO_UNKNOWN
        | Protocol::NO_DATA
}

/// Macro stages whose values last for the whole SMTP connection.
const CONNECTION_STAGES: &[u8] = b"CH";

/// Serves one milter connection from an MTA.
pub struct Server<R, W> {
    read: R,
    write: W,
    log_prefix: LogPrefix,
    session: FooterSession,

    /// The modifications the MTA agreed to.
    actions: Actions,
    /// Macros last sent by the MTA, by the stage they were sent for.
    macros: HashMap<u8, Vec<(String, String)>>,
    quit: bool,
}

impl<R: Read, W: Write> Server<R, W> {
    pub fn new(
        read: R,
        write: W,
        catalog: Arc<FooterCatalog>,
        config: Arc<MilterConfig>,
        log_prefix: LogPrefix,
    ) -> Self {
        Server {
            read,
            write,
            session: FooterSession::new(catalog, config, log_prefix.clone()),
            log_prefix,
            actions: wanted_actions(),
            macros: HashMap::new(),
            quit: false,
        }
    }

    /// Process commands until the MTA quits or closes the connection.
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.quit {
            let command = match codec::read_command(&mut self.read)? {
                Some(command) => command,
                None => {
                    debug!("{} MTA closed connection", self.log_prefix);
                    return Ok(());
                },
            };

            self.handle_command(command)?;
            self.write.flush()?;
        }

        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::OptionNegotiation {
                version,
                actions,
                protocol,
            } => self.cmd_option_negotiation(version, actions, protocol),

            Command::Macros { stage, macros } => {
                self.cmd_macros(stage, macros);
                Ok(())
            },

            Command::Connect {
                hostname,
                family,
                port,
                address,
            } => {
                debug!(
                    "{} SMTP client {} [{}] family {} port {}",
                    self.log_prefix, hostname, address, family as char, port
                );
                let daemon = self
                    .macro_value(None, "daemon_name")
                    .map(str::to_owned);
                self.session.on_connect(daemon.as_deref());
                self.respond(Response::Continue)
            },

            Command::Mail(args) => {
                let sender = self
                    .macro_value(Some(b'M'), "mail_addr")
                    .map(str::to_owned)
                    .or_else(|| args.first().map(|a| envelope_sender(a)))
                    .unwrap_or_default();
                self.session.on_sender_known(&sender);
                self.respond(Response::Continue)
            },

            Command::Helo(_)
            | Command::Recipient(_)
            | Command::Data
            | Command::Unknown(_) => self.respond(Response::Continue),

            Command::Header { name, value } => {
                self.session.on_header(&name, &value);
                self.respond(Response::Continue)
            },

            Command::EndOfHeaders => {
                self.session.on_end_of_headers();
                self.respond(Response::Continue)
            },

            Command::Body(chunk) => {
                self.session.on_body_chunk(&chunk);
                self.respond(Response::Continue)
            },

            Command::EndOfBody(chunk) => {
                if !chunk.is_empty() {
                    self.session.on_body_chunk(&chunk);
                }

                let modifications = self.session.on_end_of_message();
                let body_replaced = modifications
                    .iter()
                    .any(|m| matches!(*m, Modification::ReplaceBody(_)));
                if body_replaced && !self.actions.contains(Actions::CHANGE_BODY)
                {
                    // The added header claims the body was modified
                    warn!(
                        "{} MTA does not permit replacing the body, \
                         leaving message unmodified",
                        self.log_prefix
                    );
                } else {
                    for modification in modifications {
                        self.send_modification(modification)?;
                    }
                }
                self.end_message();
                self.respond(Response::Continue)
            },

            // The MTA does not expect a response to any of these
            Command::Abort => {
                self.session.on_abort();
                self.end_message();
                self.log_prefix.clear_message();
                Ok(())
            },

            Command::Quit => {
                self.quit = true;
                Ok(())
            },

            Command::QuitNewConnection => {
                self.session.reset();
                self.macros.clear();
                Ok(())
            },
        }
    }

    fn cmd_option_negotiation(
        &mut self,
        version: u32,
        actions: Actions,
        protocol: Protocol,
    ) -> Result<(), Error> {
        if version < 2 {
            return Err(Error::MalformedPacket("unsupported protocol version"));
        }

        self.actions = actions & wanted_actions();
        if self.actions != wanted_actions() {
            warn!(
                "{} MTA only allows actions {:?}; some footers will not be \
                 applied",
                self.log_prefix, self.actions
            );
        }

        debug!(
            "{} Negotiated version {}, actions {:?}",
            self.log_prefix, version, self.actions
        );

        self.respond(Response::OptionNegotiation {
            version: version.min(codec::PROTOCOL_VERSION),
            actions: self.actions,
            protocol: protocol & skipped_steps(),
        })
    }

    fn cmd_macros(&mut self, stage: u8, macros: Vec<(String, String)>) {
        for &(ref name, ref value) in &macros {
            if "i" == unbrace(name) {
                self.log_prefix.set_queue_id(value.clone());
            }
        }

        self.macros.insert(stage, macros);
    }

    /// Look up the macro `name`, with or without braces, in `stage` or, if
    /// `None`, any stage.
    fn macro_value(&self, stage: Option<u8>, name: &str) -> Option<&str> {
        self.macros
            .iter()
            .filter(|&(s, _)| stage.map_or(true, |stage| stage == *s))
            .flat_map(|(_, macros)| macros.iter())
            .find(|&&(ref n, _)| unbrace(n) == name)
            .map(|&(_, ref v)| &v[..])
            .filter(|v| !v.is_empty())
    }

    /// Forget the macros belonging to the message which just ended.
    fn end_message(&mut self) {
        self.macros
            .retain(|stage, _| CONNECTION_STAGES.contains(stage));
    }

    fn send_modification(
        &mut self,
        modification: Modification,
    ) -> Result<(), Error> {
        let (required, response) = match modification {
            Modification::ReplaceBody(body) => {
                (Actions::CHANGE_BODY, Response::ReplaceBody(body))
            },
            Modification::AddHeader { name, value } => {
                (Actions::ADD_HEADERS, Response::AddHeader { name, value })
            },
        };

        if self.actions.contains(required) {
            self.respond(response)
        } else {
            info!(
                "{} Not permitted to send {:?}, skipping",
                self.log_prefix, required
            );
            Ok(())
        }
    }

    fn respond(&mut self, response: Response) -> Result<(), Error> {
        response.write_to(&mut self.write)?;
        Ok(())
    }
}

fn unbrace(name: &str) -> &str {
    name.strip_prefix('{')
        .and_then(|n| n.strip_suffix('}'))
        .unwrap_or(name)
}

/// Extract the address from the first argument of `MAIL FROM`.
///
/// Anything the address grammar rejects is still used, minus any angle
/// brackets, since an unusual sender may still have a footer configured.
fn envelope_sender(arg: &str) -> String {
    let arg = arg.trim();
    if let Some(addr) = parse_envelope_sender(arg.as_bytes()) {
        return addr.to_string();
    }

    arg.strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(arg)
        .to_owned()
}
