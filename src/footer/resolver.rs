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

//! Decides which footer, if any, applies to an envelope sender.

use super::mapping::{FooterMapping, FooterMappings};

/// Which rule matched the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchTier {
    /// The full address is a key in one of the maps.
    Exact,
    /// `@domain` is a key in one of the maps.
    Domain,
    /// The sender's domain contains the domain of some key.
    DomainSuffix,
}

/// The outcome of resolving one envelope sender.
///
/// The text and HTML maps are searched independently in the last tier, so
/// the key adopted for each may differ.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedSender {
    pub text_key: Option<String>,
    pub html_key: Option<String>,
    pub tier: Option<MatchTier>,
    pub footer_available: bool,
}

impl ResolvedSender {
    fn both(key: &str, tier: MatchTier) -> Self {
        ResolvedSender {
            text_key: Some(key.to_owned()),
            html_key: Some(key.to_owned()),
            tier: Some(tier),
            footer_available: true,
        }
    }

    pub fn text_footer<'m>(
        &self,
        mappings: &'m FooterMappings,
    ) -> Option<&'m str> {
        self.text_key
            .as_deref()
            .and_then(|key| mappings.text.get(key))
    }

    pub fn html_footer<'m>(
        &self,
        mappings: &'m FooterMappings,
    ) -> Option<&'m str> {
        self.html_key
            .as_deref()
            .and_then(|key| mappings.html.get(key))
    }
}

/// Find the footer keys for `sender`.
///
/// The first of these to succeed wins:
///
/// - `sender` itself is a key in either map.
/// - `@domain` taken from `sender` is a key in either map.
/// - Each map on its own: the first key, in map order, whose domain (the
///   part after `@`, or the whole key if it has none) occurs within the
///   domain of `sender`.
///
/// A sender without `@` can only match exactly.
pub fn resolve(
    sender: &str,
    text: &FooterMapping,
    html: &FooterMapping,
) -> ResolvedSender {
    if text.contains_key(sender) || html.contains_key(sender) {
        return ResolvedSender::both(sender, MatchTier::Exact);
    }

    let at = match sender.find('@') {
        Some(at) => at,
        None => return ResolvedSender::default(),
    };

    let domain_key = &sender[at..];
    if text.contains_key(domain_key) || html.contains_key(domain_key) {
        return ResolvedSender::both(domain_key, MatchTier::Domain);
    }

    let sender_domain = &sender[at + 1..];
    let text_key = domain_suffix_match(sender_domain, text);
    let html_key = domain_suffix_match(sender_domain, html);
    let footer_available = text_key.is_some() || html_key.is_some();
    ResolvedSender {
        text_key,
        html_key,
        tier: Some(MatchTier::DomainSuffix).filter(|_| footer_available),
        footer_available,
    }
}

fn domain_suffix_match(
    sender_domain: &str,
    mapping: &FooterMapping,
) -> Option<String> {
    mapping
        .iter()
        .map(|(key, _)| key)
        .find(|key| {
            let key_domain = key.find('@').map_or(*key, |at| &key[at + 1..]);
            !key_domain.is_empty() && sender_domain.contains(key_domain)
        })
        .map(str::to_owned)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn mapping(keys: &[&str]) -> FooterMapping {
        keys.iter()
            .map(|&k| (k.to_owned(), format!("footer for {}", k)))
            .collect()
    }

    #[test]
    fn exact_match() {
        let text = mapping(&["alice@example.com", "@example.com"]);
        let r = resolve("alice@example.com", &text, &FooterMapping::new());
        assert_eq!(Some(MatchTier::Exact), r.tier);
        assert!(r.footer_available);
        assert_eq!(Some("alice@example.com"), r.text_key.as_deref());
        assert_eq!(Some("alice@example.com"), r.html_key.as_deref());
    }

    #[test]
    fn domain_match_adopts_domain_key() {
        let html = mapping(&["@a.b"]);
        let r = resolve("user@a.b", &FooterMapping::new(), &html);
        assert_eq!(Some(MatchTier::Domain), r.tier);
        assert_eq!(Some("@a.b"), r.html_key.as_deref());
        assert_eq!(Some("@a.b"), r.text_key.as_deref());

        let mappings = FooterMappings {
            text: FooterMapping::new(),
            html,
        };
        assert_eq!(Some("footer for @a.b"), r.html_footer(&mappings));
        assert_eq!(None, r.text_footer(&mappings));
    }

    #[test]
    fn domain_suffix_match_scans_maps_independently() {
        let text = mapping(&["other.org", "a.b", "x@sub.a.b"]);
        let html = mapping(&["@sub.a.b.example", "someone@sub.a.b"]);

        let r = resolve("user@sub.a.b", &text, &html);
        assert_eq!(Some(MatchTier::DomainSuffix), r.tier);
        assert!(r.footer_available);
        assert_eq!(Some("a.b"), r.text_key.as_deref());
        assert_eq!(Some("someone@sub.a.b"), r.html_key.as_deref());
    }

    #[test]
    fn domain_suffix_match_in_one_map_only() {
        let r = resolve(
            "user@mail.example.com",
            &FooterMapping::new(),
            &mapping(&["@example.com.au", "example.com"]),
        );
        assert_eq!(Some(MatchTier::DomainSuffix), r.tier);
        assert_eq!(None, r.text_key);
        assert_eq!(Some("example.com"), r.html_key.as_deref());
    }

    #[test]
    fn keys_without_domain_never_match_by_suffix() {
        let text = mapping(&["x@", "@", "@example.org"]);
        let r = resolve("bob@mail.example.org", &text, &FooterMapping::new());
        assert_eq!(Some("@example.org"), r.text_key.as_deref());

        let text = mapping(&["x@", "@"]);
        assert!(!resolve("bob@example.net", &text, &text).footer_available);
    }

    #[test]
    fn no_match() {
        let text = mapping(&["alice@example.com", "@example.org", "x@"]);
        let r = resolve("bob@example.net", &text, &text);
        assert_eq!(ResolvedSender::default(), r);
        assert!(!r.footer_available);

        // Null sender
        assert!(!resolve("", &text, &text).footer_available);
        // Nothing after the @
        assert!(!resolve("bob@", &text, &text).footer_available);
    }

    #[test]
    fn sender_without_at_matches_only_exactly() {
        let text = mapping(&["postmaster", "example.com"]);
        assert_eq!(
            Some(MatchTier::Exact),
            resolve("postmaster", &text, &text).tier
        );
        assert!(!resolve("example.com.au", &text, &text).footer_available);
    }

    proptest! {
        #[test]
        fn verbatim_key_is_exact(
            keys in prop::collection::vec("[a-z@.]{0,12}", 1..8),
            pick in any::<prop::sample::Index>(),
            in_html in any::<bool>(),
        ) {
            let sender = pick.get(&keys).clone();
            let mapping = keys.iter()
                .map(|k| (k.clone(), "f".to_owned()))
                .collect::<FooterMapping>();
            let empty = FooterMapping::new();
            let r = if in_html {
                resolve(&sender, &empty, &mapping)
            } else {
                resolve(&sender, &mapping, &empty)
            };
            prop_assert_eq!(Some(MatchTier::Exact), r.tier);
            prop_assert_eq!(Some(&sender), r.text_key.as_ref());
        }

        #[test]
        fn subdomains_match_bare_domain(
            user in "[a-z]{1,8}",
            sub in "[a-z]{1,8}",
            domain in "[a-z]{1,8}\\.[a-z]{2,4}",
        ) {
            let sender = format!("{}@{}.{}", user, sub, domain);
            let r =
                resolve(&sender, &mapping(&[domain.as_str()]), &mapping(&[]));
            prop_assert_eq!(Some(MatchTier::DomainSuffix), r.tier);
            prop_assert_eq!(Some(&domain), r.text_key.as_ref());
        }

        #[test]
        fn no_at_never_resolves_without_exact_key(
            sender in "[a-z.]{1,12}",
            keys in prop::collection::vec("[a-z@.]{1,12}", 0..8),
        ) {
            let mapping = keys.iter()
                .filter(|k| **k != sender)
                .map(|k| (k.clone(), "f".to_owned()))
                .collect::<FooterMapping>();
            let r = resolve(&sender, &mapping, &mapping);
            prop_assert!(!r.footer_available);
            prop_assert_eq!(None, r.tier);
        }
    }
}
