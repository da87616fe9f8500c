//! Command normalization and safety classification.
//!
//! `normalize` rewrites aliased input (`conf t`, `sh`, `dis`) into the
//! canonical form of the active profile. `classify` labels the normalized
//! command from the profile's prefix sets. Dangerous matches win over safe
//! ones, and anything matching neither set is `Unclassified`, which callers
//! must confirm before dispatch.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::vendor::VendorProfile;

/// Safety label of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    Safe,
    Dangerous,
    Unclassified,
}

impl CommandClass {
    /// Whether the command may run without explicit confirmation.
    pub fn runs_unconfirmed(&self) -> bool {
        matches!(self, CommandClass::Safe)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandClass::Safe => "safe",
            CommandClass::Dangerous => "dangerous",
            CommandClass::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of normalizing and classifying one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub normalized: String,
    pub class: CommandClass,
    /// The prefix that decided the class, if any.
    pub matched_prefix: Option<String>,
}

/// Rewrites `command` into canonical form for `profile`.
///
/// Whitespace runs collapse to single spaces, then the longest leading token
/// sequence found in the alias map is replaced by its canonical form. Alias
/// keys compare case-insensitively; the remaining tokens keep their case.
///
/// An alias whose canonical form has more words than the alias itself
/// (`wr` -> `write memory`) only expands when nothing follows it, so
/// `wr erase` is never read as `write memory erase`.
pub fn normalize(profile: &VendorProfile, command: &str) -> String {
    let tokens = command.split_whitespace().collect::<Vec<_>>();
    if tokens.is_empty() {
        return String::new();
    }

    let aliases = profile.aliases();
    for len in (1..=tokens.len()).rev() {
        let key = tokens[..len]
            .iter()
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(canonical) = aliases.get(&key) {
            let grows = canonical.split(' ').count() > len;
            if grows && len < tokens.len() {
                continue;
            }
            let mut out = canonical.clone();
            for rest in &tokens[len..] {
                out.push(' ');
                out.push_str(rest);
            }
            return out;
        }
    }

    tokens.join(" ")
}

fn longest_prefix<'a>(prefixes: &'a [Vec<String>], tokens: &[String]) -> Option<&'a Vec<String>> {
    prefixes
        .iter()
        .filter(|prefix| {
            prefix.len() <= tokens.len() && prefix.iter().zip(tokens).all(|(p, t)| p == t)
        })
        .max_by_key(|prefix| prefix.len())
}

fn lowered_tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Normalizes and classifies `command`, reporting the deciding prefix.
///
/// The command is checked against the dangerous prefixes both as typed and
/// as normalized; either match makes it dangerous.
pub fn inspect(profile: &VendorProfile, command: &str) -> Classification {
    let normalized = normalize(profile, command);
    let tokens = lowered_tokens(&normalized);

    let dangerous = longest_prefix(profile.dangerous_prefixes(), &tokens)
        .or_else(|| longest_prefix(profile.dangerous_prefixes(), &lowered_tokens(command)));
    if let Some(prefix) = dangerous {
        return Classification {
            normalized,
            class: CommandClass::Dangerous,
            matched_prefix: Some(prefix.join(" ")),
        };
    }
    if let Some(prefix) = longest_prefix(profile.safe_prefixes(), &tokens) {
        return Classification {
            normalized,
            class: CommandClass::Safe,
            matched_prefix: Some(prefix.join(" ")),
        };
    }
    Classification {
        normalized,
        class: CommandClass::Unclassified,
        matched_prefix: None,
    }
}

/// Safety label of `command` under `profile`.
pub fn classify(profile: &VendorProfile, command: &str) -> CommandClass {
    inspect(profile, command).class
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::builtin;

    fn cisco() -> std::sync::Arc<VendorProfile> {
        builtin::by_name("cisco").expect("cisco profile")
    }

    #[test]
    fn conf_t_normalizes_to_configure_terminal() {
        let profile = cisco();
        assert_eq!(normalize(&profile, "  conf   t "), "configure terminal");
        assert_eq!(normalize(&profile, "CONF T"), "configure terminal");
    }

    #[test]
    fn longest_alias_prefix_wins_and_rest_is_kept() {
        let profile = cisco();
        assert_eq!(normalize(&profile, "sh ip   int brief"), "show ip int brief");
        assert_eq!(
            normalize(&profile, "int GigabitEthernet0/1"),
            "interface GigabitEthernet0/1"
        );
    }

    #[test]
    fn unaliased_input_only_collapses_whitespace() {
        let profile = cisco();
        assert_eq!(normalize(&profile, "\tshow  version\n"), "show version");
        assert_eq!(normalize(&profile, "   "), "");
    }

    #[test]
    fn configure_terminal_is_unclassified_on_cisco() {
        let profile = cisco();
        let result = inspect(&profile, "conf t");
        assert_eq!(result.normalized, "configure terminal");
        assert_eq!(result.class, CommandClass::Unclassified);
        assert!(!result.class.runs_unconfirmed());
    }

    #[test]
    fn dangerous_prefix_takes_precedence_over_safe() {
        let profile = cisco();
        assert_eq!(classify(&profile, "show version"), CommandClass::Safe);
        assert_eq!(classify(&profile, "reload in 5"), CommandClass::Dangerous);
        assert_eq!(classify(&profile, "write erase"), CommandClass::Dangerous);
        assert_eq!(
            inspect(&profile, "write erase").matched_prefix.as_deref(),
            Some("write erase")
        );
    }

    #[test]
    fn growing_alias_expands_only_when_alone() {
        let profile = cisco();
        assert_eq!(normalize(&profile, "wr"), "write memory");
        assert_eq!(normalize(&profile, "wr mem"), "wr mem");
        assert_eq!(normalize(&profile, "config"), "configure terminal");
        assert_eq!(
            normalize(&profile, "config replace flash:golden.cfg"),
            "config replace flash:golden.cfg"
        );
    }

    #[test]
    fn wr_erase_stays_dangerous() {
        let profile = cisco();
        let result = inspect(&profile, "wr erase");
        assert_eq!(result.normalized, "write erase");
        assert_eq!(result.class, CommandClass::Dangerous);
        assert_eq!(result.matched_prefix.as_deref(), Some("write erase"));
        assert_eq!(classify(&profile, "WR   ERASE"), CommandClass::Dangerous);
    }

    #[test]
    fn prefixes_match_whole_tokens_only() {
        let profile = cisco();
        assert_eq!(classify(&profile, "showrun"), CommandClass::Unclassified);
        assert_eq!(classify(&profile, "reloaded"), CommandClass::Unclassified);
    }

    #[test]
    fn comware_display_is_safe_and_reboot_dangerous() {
        let profile = builtin::by_name("h3c").expect("h3c profile");
        assert_eq!(classify(&profile, "dis version"), CommandClass::Safe);
        assert_eq!(classify(&profile, "reboot"), CommandClass::Dangerous);
        assert_eq!(classify(&profile, "sys"), CommandClass::Unclassified);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn command_strategy() -> impl Strategy<Value = String> {
            let words = prop::sample::select(vec![
                "conf", "t", "sh", "show", "int", "reload", "write", "erase", "en", "wr",
                "dis", "version", "ip", "GigabitEthernet0/1", "config", "terminal", "  ",
            ]);
            prop::collection::vec(words, 0..6).prop_map(|w| w.join(" "))
        }

        proptest! {
            #[test]
            fn normalize_is_idempotent(cmd in command_strategy(), vendor in 0usize..4) {
                let profile = builtin::by_name(builtin::BUILTIN_VENDORS[vendor]).expect("profile");
                let once = normalize(&profile, &cmd);
                prop_assert_eq!(normalize(&profile, &once), once);
            }

            #[test]
            fn dangerous_commands_are_never_safe(cmd in command_strategy(), vendor in 0usize..4) {
                let profile = builtin::by_name(builtin::BUILTIN_VENDORS[vendor]).expect("profile");
                for prefix in profile.dangerous_prefixes() {
                    let dangerous = format!("{} {}", prefix.join(" "), cmd);
                    prop_assert_eq!(classify(&profile, &dangerous), CommandClass::Dangerous);
                }
            }
        }
    }
}
