//! Vendor detection from the bytes a device sends right after connect.
//!
//! Every registered profile is scored against the banner and the trailing
//! prompt: a banner signature is strong evidence, a prompt shape alone is
//! weak. The best score wins; a tie is reported instead of guessed.

use std::sync::Arc;

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::channel::{clean_text, prompt_candidate};
use crate::error::SwitchError;
use crate::vendor::{Mode, VendorId, VendorRegistry};

/// Strength of the evidence for a vendor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// The trailing prompt matches the vendor's grammar.
    Medium,
    /// A banner signature of the vendor was seen.
    High,
}

/// Result of a successful detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Detection {
    pub vendor: VendorId,
    pub confidence: Confidence,
    /// Mode of the trailing prompt, if the prompt was recognised.
    pub mode: Option<Mode>,
    pub prompt: String,
}

/// Scores registered profiles against connect-time output.
#[derive(Debug, Clone)]
pub struct VendorDetector {
    registry: Arc<VendorRegistry>,
}

impl VendorDetector {
    pub fn new(registry: Arc<VendorRegistry>) -> Self {
        Self { registry }
    }

    /// Every vendor with some evidence, in registry order.
    pub fn scores(&self, raw: &[u8]) -> Vec<(VendorId, Confidence)> {
        let text = clean_text(raw);
        let prompt = prompt_candidate(&text);
        self.registry
            .iter()
            .filter_map(|profile| {
                if profile.matches_banner(&text) {
                    Some((profile.id().clone(), Confidence::High))
                } else if !prompt.is_empty() && profile.grammar().classify(&prompt).is_some() {
                    Some((profile.id().clone(), Confidence::Medium))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Infers the vendor. Pure: the same bytes and registry always give the
    /// same answer.
    pub fn detect(&self, raw: &[u8]) -> Result<Detection, SwitchError> {
        let prompt = prompt_candidate(&clean_text(raw));
        let scores = self.scores(raw);
        let Some(best) = scores.iter().map(|(_, confidence)| *confidence).max() else {
            debug!("no vendor matches prompt {:?}", prompt);
            return Err(SwitchError::UnknownVendor { prompt });
        };

        let mut candidates = scores
            .into_iter()
            .filter(|(_, confidence)| *confidence == best)
            .map(|(vendor, _)| vendor)
            .collect::<Vec<_>>();
        if candidates.len() > 1 {
            candidates.sort();
            debug!("ambiguous vendor for prompt {:?}: {:?}", prompt, candidates);
            return Err(SwitchError::AmbiguousVendor { candidates });
        }

        let vendor = candidates.remove(0);
        let detection = self.assume(&vendor, raw)?;
        debug!(
            "detected {} ({:?}) from prompt {:?}",
            detection.vendor, best, detection.prompt
        );
        Ok(Detection {
            confidence: best,
            ..detection
        })
    }

    /// Commits to `vendor` without scoring, e.g. after a manual selection.
    pub fn assume(&self, vendor: &VendorId, raw: &[u8]) -> Result<Detection, SwitchError> {
        let profile = self.registry.profile(vendor)?;
        let text = clean_text(raw);
        let prompt = prompt_candidate(&text);
        let confidence = if profile.matches_banner(&text) {
            Confidence::High
        } else {
            Confidence::Medium
        };
        Ok(Detection {
            vendor: vendor.clone(),
            confidence,
            mode: profile.grammar().classify(&prompt).map(|rule| rule.mode()),
            prompt,
        })
    }

    /// True once the tail of `raw` looks like a prompt of any vendor.
    pub fn sees_prompt(&self, raw: &[u8]) -> bool {
        let prompt = prompt_candidate(&clean_text(raw));
        !prompt.is_empty()
            && self
                .registry
                .iter()
                .any(|profile| profile.grammar().classify(&prompt).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::BUILTIN_REGISTRY;

    fn detector() -> VendorDetector {
        VendorDetector::new(BUILTIN_REGISTRY.clone())
    }

    #[test]
    fn cisco_prompt_alone_is_unique() {
        let detection = detector().detect(b"\r\nCore-SW1>").expect("cisco");
        assert_eq!(detection.vendor, VendorId::CISCO);
        assert_eq!(detection.confidence, Confidence::Medium);
        assert_eq!(detection.mode, Some(Mode::User));
    }

    #[test]
    fn juniper_operational_prompt_maps_to_privileged() {
        let detection = detector()
            .detect(b"--- JUNOS 20.4R3 built 2021-01-01\r\n\r\nnetops@ex4300> ")
            .expect("juniper");
        assert_eq!(detection.vendor, VendorId::JUNIPER);
        assert_eq!(detection.confidence, Confidence::High);
        assert_eq!(detection.mode, Some(Mode::Privileged));
    }

    #[test]
    fn comware_and_vrp_prompts_are_ambiguous_without_banner() {
        let err = detector().detect(b"\r\n<Core>").expect_err("shared shape");
        match err {
            SwitchError::AmbiguousVendor { candidates } => {
                assert_eq!(candidates, vec![VendorId::new("h3c"), VendorId::new("huawei")]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn banner_signature_resolves_shared_prompt_shape() {
        let raw = b"Huawei Versatile Routing Platform Software\r\nVRP (R) software, Version 8.180\r\n<HUAWEI>";
        let detection = detector().detect(raw).expect("huawei");
        assert_eq!(detection.vendor, VendorId::HUAWEI);
        assert_eq!(detection.confidence, Confidence::High);
        assert_eq!(detection.mode, Some(Mode::User));
    }

    #[test]
    fn unknown_prompt_fails_with_unknown_vendor() {
        let err = detector()
            .detect(b"Welcome to BusyBox\r\n~ $ ")
            .expect_err("nothing matches");
        assert!(matches!(err, SwitchError::UnknownVendor { .. }));
    }

    #[test]
    fn detection_is_deterministic() {
        let inputs: [&[u8]; 4] = [
            b"\r\nsw1#",
            b"\r\n<Core>",
            b"Username: ",
            b"\x1b[0m[~HUAWEI]",
        ];
        let detector = detector();
        for raw in inputs {
            let first = format!("{:?}", detector.detect(raw));
            for _ in 0..10 {
                assert_eq!(format!("{:?}", detector.detect(raw)), first);
            }
        }
    }

    #[test]
    fn assume_reports_mode_for_forced_vendor() {
        let detection = detector()
            .assume(&VendorId::new("h3c"), b"\r\n[Core-GigabitEthernet1/0/1]")
            .expect("h3c");
        assert_eq!(detection.mode, Some(Mode::ConfigInterface));
        assert!(detector().sees_prompt(b"banner\r\nsw1#"));
        assert!(!detector().sees_prompt(b"banner\r\n"));
    }
}
