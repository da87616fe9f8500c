use proptest::prelude::*;
use rswitch::classify::{self, CommandClass};
use rswitch::detect::{Confidence, VendorDetector};
use rswitch::error::SwitchError;
use rswitch::vendor::{BUILTIN_REGISTRY, Mode, VendorId, VendorRegistry, builtin};
use std::sync::Arc;

const EOS_JSON: &str = r#"{
  "id": "arista",
  "display_name": "Arista EOS",
  "family": "eos",
  "banner_signatures": ["Arista Networks"],
  "prompts": [
    {"mode": "config-interface", "pattern": "^[^\\s#>()]+\\(config-if-[^)]+\\)#\\s*$"},
    {"mode": "config", "pattern": "^[^\\s#>()]+\\(config[^)]*\\)#\\s*$"},
    {"mode": "privileged", "pattern": "^[^\\s#>()]+#\\s*$"},
    {"mode": "user", "pattern": "^[^\\s#>()]+>\\s*$"}
  ],
  "aliases": {"sh": "show"},
  "safe_prefixes": ["show"],
  "dangerous_prefixes": ["reload"],
  "transitions": [
    {"from": "user", "to": "privileged", "command": "enable"},
    {"from": "privileged", "to": "config", "command": "configure"},
    {"from": "config", "to": "privileged", "command": "end"},
    {"from": "config", "to": "config-interface", "command": "interface {interface}"},
    {"from": "config-interface", "to": "config", "command": "exit"}
  ]
}"#;

#[test]
fn builtin_registry_holds_the_four_vendors_in_id_order() {
    assert_eq!(
        BUILTIN_REGISTRY.ids(),
        vec![
            VendorId::new("cisco"),
            VendorId::new("h3c"),
            VendorId::new("huawei"),
            VendorId::new("juniper"),
        ]
    );
    assert_eq!(builtin::available_vendors().len(), BUILTIN_REGISTRY.len());
}

#[test]
fn every_transition_target_has_a_prompt_rule() {
    for profile in BUILTIN_REGISTRY.iter() {
        for (from, to, command) in profile.transitions() {
            assert!(
                profile.grammar().has_mode(to),
                "{}: {from} -> {to} via {command:?} lands on a mode without prompt",
                profile.id()
            );
        }
        assert!(profile.grammar().has_mode(Mode::User), "{}", profile.id());
        assert!(profile.grammar().has_mode(Mode::Privileged), "{}", profile.id());
        let report = profile.diagnose();
        assert!(!report.has_issues(), "{}: {report:?}", profile.id());
    }
}

#[test]
fn catalog_reports_families_and_capabilities() {
    let catalog = builtin::vendor_catalog();
    let families = catalog
        .iter()
        .map(|meta| (meta.id.as_str().to_string(), meta.family.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        families,
        [
            ("cisco".to_string(), "ios".to_string()),
            ("h3c".to_string(), "comware".to_string()),
            ("juniper".to_string(), "junos".to_string()),
            ("huawei".to_string(), "vrp".to_string()),
        ]
    );

    let junos = builtin::vendor_metadata("JUNIPER").expect("case-insensitive");
    assert!(junos.capabilities.commit_model);
    assert!(junos.capabilities.hierarchical_set);
    let vrp = builtin::vendor_metadata("huawei").expect("huawei");
    assert!(vrp.capabilities.undo_negation);
    assert!(!vrp.capabilities.commit_model);

    let err = builtin::vendor_metadata("extreme").expect_err("not built in");
    assert!(matches!(err, SwitchError::VendorNotRegistered(_)));
}

#[test]
fn diagnostics_serialize_for_every_vendor() {
    let json = builtin::diagnose_all_vendors_json().expect("diagnostics");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    for name in builtin::available_vendors() {
        assert!(value.get(*name).is_some(), "{name}");
    }
    let h3c = builtin::diagnose_vendor("h3c").expect("h3c");
    assert!(h3c.potentially_ambiguous_prompt_modes.contains(&Mode::User));
    assert!(h3c.potentially_ambiguous_prompt_modes.contains(&Mode::Privileged));
}

#[test]
fn a_fifth_vendor_is_added_from_a_document() {
    let mut registry = VendorRegistry::with_builtins().expect("builtins");
    assert_eq!(registry.load_json(EOS_JSON).expect("eos"), 1);
    assert_eq!(registry.len(), 5);

    let detector = VendorDetector::new(Arc::new(registry));
    let detection = detector
        .detect(b"Arista Networks EOS shell\r\n\r\nleaf1>")
        .expect("arista");
    assert_eq!(detection.vendor, VendorId::new("arista"));
    assert_eq!(detection.confidence, Confidence::High);
    assert_eq!(detection.mode, Some(Mode::User));
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut registry = VendorRegistry::with_builtins().expect("builtins");
    let err = registry
        .register(builtin::load("cisco").expect("cisco"))
        .expect_err("duplicate");
    assert!(matches!(err, SwitchError::DuplicateVendor(id) if id == VendorId::CISCO));
}

#[test]
fn incomplete_grammar_is_rejected_at_registration() {
    let json = r#"{
      "id": "broken",
      "prompts": [{"mode": "user", "pattern": "^\\S+>\\s*$"}]
    }"#;
    let mut registry = VendorRegistry::new();
    let err = registry.load_json(json).expect_err("no privileged prompt");
    assert!(matches!(err, SwitchError::InvalidProfile { vendor, .. } if vendor == "broken"));
    assert!(registry.is_empty());
}

#[test]
fn transition_to_a_mode_without_prompt_is_rejected() {
    let json = r#"{
      "id": "broken",
      "prompts": [
        {"mode": "privileged", "pattern": "^\\S+#\\s*$"},
        {"mode": "user", "pattern": "^\\S+>\\s*$"}
      ],
      "transitions": [{"from": "privileged", "to": "config", "command": "configure"}]
    }"#;
    let err = VendorRegistry::new()
        .load_json(json)
        .expect_err("config has no prompt");
    assert!(matches!(err, SwitchError::InvalidProfile { .. }));
}

#[test]
fn aliases_that_break_idempotence_are_rejected() {
    let json = r#"{
      "id": "loopy",
      "prompts": [
        {"mode": "privileged", "pattern": "^\\S+#\\s*$"},
        {"mode": "user", "pattern": "^\\S+>\\s*$"}
      ],
      "aliases": {"sh": "show", "show": "display"}
    }"#;
    let err = VendorRegistry::new()
        .load_json(json)
        .expect_err("show is rewritten twice");
    assert!(matches!(err, SwitchError::InvalidProfile { .. }));
}

#[test]
fn bad_regex_is_rejected() {
    let json = r#"{
      "id": "broken",
      "prompts": [
        {"mode": "privileged", "pattern": "^(\\S+#"},
        {"mode": "user", "pattern": "^\\S+>\\s*$"}
      ]
    }"#;
    let err = VendorRegistry::new().load_json(json).expect_err("regex");
    assert!(matches!(err, SwitchError::InvalidProfile { .. }));
}

fn vendor_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(builtin::available_vendors().to_vec())
}

fn command_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop::sample::select(vec![
            "sh", "show", "dis", "display", "conf", "t", "config", "int", "Gi0/1", "sys", "q",
            "ip", "route", "wr", "en", "  ", "VLAN", "10",
        ]),
        0..6,
    )
    .prop_map(|tokens| tokens.join(" "))
}

proptest! {
    #[test]
    fn normalize_is_idempotent(vendor in vendor_strategy(), command in command_strategy()) {
        let profile = builtin::by_name(vendor).expect("profile");
        let once = classify::normalize(&profile, &command);
        prop_assert_eq!(classify::normalize(&profile, &once), once);
    }

    #[test]
    fn dangerous_prefixes_are_never_safe(
        vendor in vendor_strategy(),
        index in 0usize..64,
        suffix in "[a-z0-9/ ]{0,16}",
    ) {
        let profile = builtin::by_name(vendor).expect("profile");
        let prefixes = profile.dangerous_prefixes();
        prop_assume!(!prefixes.is_empty());
        let prefix = prefixes[index % prefixes.len()].join(" ");
        let command = format!("{prefix} {suffix}");
        prop_assert_eq!(classify::classify(&profile, &command), CommandClass::Dangerous);
        prop_assert_ne!(classify::classify(&profile, &prefix), CommandClass::Safe);
    }
}
