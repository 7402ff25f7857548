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

//! Footer mappings and the catalog file they are loaded from.

use std::fs;
use std::iter::FromIterator;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::{error, info};
use serde::Deserialize;

use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// An ordered association from address patterns to footer text.
///
/// Keys are full addresses (`user@domain.tld`), domain patterns
/// (`@domain.tld`), or bare domains (`domain.tld`). Order matters for
/// domain-suffix matching, where the first matching entry wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FooterMapping {
    entries: Vec<(String, String)>,
}

impl FooterMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `footer` with `pattern`.
    ///
    /// Inserting a pattern a second time replaces its footer but keeps its
    /// original position.
    pub fn insert(&mut self, pattern: String, footer: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.0 == pattern)
        {
            entry.1 = footer;
        } else {
            self.entries.push((pattern, footer));
        }
    }

    pub fn get(&self, pattern: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.0 == pattern)
            .map(|e| &e.1[..])
    }

    pub fn contains_key(&self, pattern: &str) -> bool {
        self.get(pattern).is_some()
    }

    /// Iterate over `(pattern, footer)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (&e.0[..], &e.1[..]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for FooterMapping {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(it: I) -> Self {
        let mut mapping = FooterMapping::new();
        for (pattern, footer) in it {
            mapping.insert(pattern, footer);
        }
        mapping
    }
}

/// The plain-text and HTML footer mappings, which are looked up
/// independently.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FooterMappings {
    pub text: FooterMapping,
    pub html: FooterMapping,
}

/// On-disk format of the footer catalog.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    footer: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogEntry {
    address: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    text_file: Option<PathBuf>,
    #[serde(default)]
    html_file: Option<PathBuf>,
}

impl FooterMappings {
    /// Load the catalog at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path).map_err(|e| catalog_error(path, e))?;
        Self::parse(&data, path)
    }

    /// Parse catalog `data` which was read from `path`.
    ///
    /// Relative `text_file` and `html_file` paths are resolved against the
    /// directory containing `path`.
    pub fn parse(data: &[u8], path: &Path) -> Result<Self, Error> {
        let file: CatalogFile = toml::from_slice(data)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut mappings = FooterMappings::default();
        for entry in file.footer {
            let text = footer_text(
                path,
                base_dir,
                &entry.address,
                entry.text,
                entry.text_file,
            )?;
            let html = footer_text(
                path,
                base_dir,
                &entry.address,
                entry.html,
                entry.html_file,
            )?;

            if text.is_none() && html.is_none() {
                return Err(catalog_error(
                    path,
                    format!("footer for '{}' has no text", entry.address),
                ));
            }

            if let Some(text) = text {
                mappings.text.insert(entry.address.clone(), text);
            }
            if let Some(html) = html {
                mappings.html.insert(entry.address, html);
            }
        }

        Ok(mappings)
    }
}

fn footer_text(
    catalog_path: &Path,
    base_dir: &Path,
    address: &str,
    inline: Option<String>,
    file: Option<PathBuf>,
) -> Result<Option<String>, Error> {
    match (inline, file) {
        (Some(_), Some(_)) => Err(catalog_error(
            catalog_path,
            format!("footer for '{}' is both inline and a file", address),
        )),
        (Some(text), None) => Ok(Some(text)),
        (None, Some(file)) => {
            let file = base_dir.join(file);
            let mut text = fs::read_to_string(&file)
                .map_err(|e| catalog_error(&file, e))?;
            // Editors like to end files with a line break the footer
            // shouldn't carry
            if text.ends_with('\n') {
                text.pop();
                if text.ends_with('\r') {
                    text.pop();
                }
            }
            Ok(Some(text))
        },
        (None, None) => Ok(None),
    }
}

fn catalog_error(path: &Path, e: impl ToString) -> Error {
    Error::FooterCatalog(path.display().to_string(), e.to_string())
}

/// The footer mappings in use, shared between all connections.
///
/// Sessions take a snapshot when the sender of a message becomes known and
/// keep it until the message is done. After each message, the catalog file
/// is reloaded if its modification time changed.
pub struct FooterCatalog {
    path: Option<PathBuf>,
    state: Mutex<CatalogState>,
}

struct CatalogState {
    mappings: Arc<FooterMappings>,
    modified: Option<SystemTime>,
}

impl FooterCatalog {
    /// Load the catalog file at `path`.
    pub fn load(path: PathBuf) -> Result<Self, Error> {
        let modified = modification_time(&path);
        let mappings = FooterMappings::load(&path)?;
        Ok(FooterCatalog {
            path: Some(path),
            state: Mutex::new(CatalogState {
                mappings: Arc::new(mappings),
                modified,
            }),
        })
    }

    /// Create a catalog that always serves `mappings`.
    pub fn fixed(mappings: FooterMappings) -> Self {
        FooterCatalog {
            path: None,
            state: Mutex::new(CatalogState {
                mappings: Arc::new(mappings),
                modified: None,
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<FooterMappings> {
        Arc::clone(&self.state.lock().unwrap().mappings)
    }

    /// Reload the catalog file if it was modified since it was last read.
    ///
    /// If the new version cannot be loaded, the previous mappings stay in
    /// effect.
    pub fn refresh(&self, log_prefix: &LogPrefix) {
        let path = match self.path {
            Some(ref path) => path,
            None => return,
        };

        let modified = modification_time(path);
        let mut state = self.state.lock().unwrap();
        if modified == state.modified {
            return;
        }

        state.modified = modified;
        match FooterMappings::load(path) {
            Ok(mappings) => {
                info!(
                    "{} Reloaded footer catalog with {} text and {} HTML \
                     footers",
                    log_prefix,
                    mappings.text.len(),
                    mappings.html.len()
                );
                state.mappings = Arc::new(mappings);
            },
            Err(e) => error!(
                "{} Keeping previous footers; reload failed: {}",
                log_prefix, e
            ),
        }
    }
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|md| md.modified()).ok()
}

#[cfg(test)]
mod test {
    use nix::sys::stat::utimes;
    use nix::sys::time::{TimeVal, TimeValLike};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn mapping_keeps_insertion_order() {
        let mut mapping = FooterMapping::new();
        mapping.insert("b.example".to_owned(), "B".to_owned());
        mapping.insert("@a.example".to_owned(), "A".to_owned());
        mapping.insert("b.example".to_owned(), "B2".to_owned());

        assert_eq!(2, mapping.len());
        assert_eq!(Some("B2"), mapping.get("b.example"));
        assert!(mapping.contains_key("@a.example"));
        assert!(!mapping.contains_key("a.example"));
        assert_eq!(
            vec![("b.example", "B2"), ("@a.example", "A")],
            mapping.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn parse_catalog() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bob.html"), "<p>Bob</p>\n").unwrap();

        let mappings = FooterMappings::parse(
            br#"
[[footer]]
address = "alice@example.com"
text = "Regards, Alice"

[[footer]]
address = "@example.org"
text = "-- \nExample Org"
html = "<p>Example Org</p>"

[[footer]]
address = "bob@example.net"
html_file = "bob.html"
"#,
            &dir.path().join("footers.toml"),
        )
        .unwrap();

        assert_eq!(
            vec![
                ("alice@example.com", "Regards, Alice"),
                ("@example.org", "-- \nExample Org"),
            ],
            mappings.text.iter().collect::<Vec<_>>()
        );
        assert_eq!(
            vec![
                ("@example.org", "<p>Example Org</p>"),
                ("bob@example.net", "<p>Bob</p>"),
            ],
            mappings.html.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn parse_catalog_errors() {
        let path = Path::new("/nonexistent/footers.toml");
        assert_matches!(
            Err(Error::FooterCatalog(..)),
            FooterMappings::parse(
                b"[[footer]]\naddress = \"a@b\"\n",
                path
            )
        );
        assert_matches!(
            Err(Error::FooterCatalog(..)),
            FooterMappings::parse(
                b"[[footer]]\naddress = \"a@b\"\ntext = \"x\"\n\
                  text_file = \"x.txt\"\n",
                path
            )
        );
        assert_matches!(
            Err(Error::FooterCatalog(..)),
            FooterMappings::parse(
                b"[[footer]]\naddress = \"a@b\"\ntext_file = \"x.txt\"\n",
                path
            )
        );
        assert_matches!(
            Err(Error::Toml(..)),
            FooterMappings::parse(b"[[footer]]\nadress = \"a@b\"\n", path)
        );
    }

    fn set_mtime(path: &Path, secs: i64) {
        let time = TimeVal::seconds(secs);
        utimes(path, &time, &time).unwrap();
    }

    #[test]
    fn catalog_reloads_when_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("footers.toml");
        let log_prefix = LogPrefix::new("test".to_owned());

        fs::write(&path, "[[footer]]\naddress = \"a@b\"\ntext = \"one\"\n")
            .unwrap();
        set_mtime(&path, 1_000_000);

        let catalog = FooterCatalog::load(path.clone()).unwrap();
        let first = catalog.snapshot();
        assert_eq!(Some("one"), first.text.get("a@b"));

        // Unchanged file, same mappings
        catalog.refresh(&log_prefix);
        assert!(Arc::ptr_eq(&first, &catalog.snapshot()));

        fs::write(&path, "[[footer]]\naddress = \"a@b\"\ntext = \"two\"\n")
            .unwrap();
        set_mtime(&path, 2_000_000);
        catalog.refresh(&log_prefix);
        assert_eq!(Some("two"), catalog.snapshot().text.get("a@b"));
        // Snapshots already handed out are unaffected
        assert_eq!(Some("one"), first.text.get("a@b"));

        fs::write(&path, "this is not toml = = =").unwrap();
        set_mtime(&path, 3_000_000);
        catalog.refresh(&log_prefix);
        assert_eq!(Some("two"), catalog.snapshot().text.get("a@b"));
    }
}
