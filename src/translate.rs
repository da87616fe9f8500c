//! Cross-vendor translation of logical operations.
//!
//! The table maps an operation name to one command template per vendor.
//! Templates hold `{name}` placeholders. Forward translation renders a
//! template; reverse translation matches observed commands against every
//! template of the source vendor and re-renders the winner for the target.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::classify;
use crate::error::SwitchError;
use crate::vendor::{BUILTIN_REGISTRY, Mode, VendorId, VendorRegistry};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(err) => panic!("invalid PLACEHOLDER regex: {err}"),
    });

const BUILTIN_TABLE_JSON: &str = include_str!("../profiles/translations.json");

/// The built-in translation table. Falls back to an empty table if the
/// embedded document is broken.
pub static BUILTIN_TABLE: Lazy<Arc<TranslationTable>> = Lazy::new(|| {
    match TranslationTable::from_json(BUILTIN_TABLE_JSON) {
        Ok(table) => Arc::new(table),
        Err(err) => {
            log::warn!("built-in translation table failed to load: {err}");
            Arc::new(TranslationTable::default())
        }
    }
});

/// Parameters bound to placeholders.
pub type Params = BTreeMap<String, String>;

/// Substitutes placeholders. Returns the first unbound name on failure.
pub fn render_template(template: &str, params: &Params) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let name = &caps[1];
        let value = params.get(name).ok_or_else(|| name.to_string())?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Placeholder names in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// One vendor's rendering of an operation, as written in the table document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateDocument {
    pub commands: Vec<String>,
    /// Mode the commands must be entered in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
}

/// Serialized form of a translation table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TranslationDocument {
    pub operations: BTreeMap<String, BTreeMap<String, TemplateDocument>>,
}

/// Commands for one operation on one vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RenderedOperation {
    pub operation: String,
    pub vendor: VendorId,
    pub commands: Vec<String>,
    pub mode: Option<Mode>,
}

/// An operation recognised in observed commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OperationMatch {
    pub operation: String,
    pub params: Params,
}

#[derive(Debug, Clone)]
struct LinePattern {
    regex: Regex,
    names: Vec<String>,
    /// Placeholders followed by more text, which bind exactly one token.
    single_token: Vec<String>,
}

#[derive(Debug, Clone)]
struct Template {
    commands: Vec<String>,
    mode: Option<Mode>,
    lines: Vec<LinePattern>,
    literal_len: usize,
}

fn literal_pattern(text: &str, out: &mut String) -> usize {
    let mut literal_len = 0;
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push_str(r"\s+");
                in_space = true;
            }
        } else {
            in_space = false;
            literal_len += 1;
            out.push_str(&regex::escape(ch.encode_utf8(&mut [0u8; 4])));
        }
    }
    literal_len
}

fn compile_line(line: &str) -> Result<(LinePattern, usize), regex::Error> {
    let line = line.trim();
    let mut pattern = String::from("(?i)^");
    let mut names = Vec::new();
    let mut single_token = Vec::new();
    let mut literal_len = 0;
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(line) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        literal_len += literal_pattern(&line[last..whole.start()], &mut pattern);
        if line[whole.end()..].trim().is_empty() {
            pattern.push_str("(.+)");
        } else {
            pattern.push_str(r"(\S+)");
            single_token.push(caps[1].to_string());
        }
        names.push(caps[1].to_string());
        last = whole.end();
    }
    literal_len += literal_pattern(&line[last..], &mut pattern);
    pattern.push('$');
    let regex = Regex::new(&pattern)?;
    Ok((
        LinePattern {
            regex,
            names,
            single_token,
        },
        literal_len,
    ))
}

impl Template {
    fn compile(operation: &str, vendor: &str, doc: TemplateDocument) -> Result<Self, SwitchError> {
        if doc.commands.iter().all(|c| c.trim().is_empty()) {
            return Err(SwitchError::InternalServerError(format!(
                "translation {operation}/{vendor} has no commands"
            )));
        }
        let mut lines = Vec::with_capacity(doc.commands.len());
        let mut literal_len = 0;
        for command in &doc.commands {
            let (line, len) = compile_line(command).map_err(|e| {
                SwitchError::InternalServerError(format!(
                    "translation {operation}/{vendor} template {command:?}: {e}"
                ))
            })?;
            lines.push(line);
            literal_len += len;
        }
        Ok(Self {
            commands: doc.commands,
            mode: doc.mode,
            lines,
            literal_len,
        })
    }

    /// Binds parameters if `observed` has the template's exact shape.
    fn bind(&self, observed: &[String]) -> Option<Params> {
        if observed.len() != self.lines.len() {
            return None;
        }
        let mut params = Params::new();
        for (line, text) in self.lines.iter().zip(observed) {
            let caps = line.regex.captures(text)?;
            for (i, name) in line.names.iter().enumerate() {
                let value = caps.get(i + 1)?.as_str().trim().to_string();
                match params.get(name) {
                    Some(bound) if *bound != value => return None,
                    Some(_) => {}
                    None => {
                        params.insert(name.clone(), value);
                    }
                }
            }
        }
        Some(params)
    }

    /// A value bound to a single-token placeholder must be one token, or the
    /// rendered command would not parse the way the template reads.
    fn check_values(&self, operation: &str, params: &Params) -> Result<(), SwitchError> {
        for name in self.lines.iter().flat_map(|line| &line.single_token) {
            if let Some(value) = params.get(name)
                && (value.trim().is_empty() || value.trim().contains(char::is_whitespace))
            {
                return Err(SwitchError::InvalidParameter {
                    operation: operation.to_string(),
                    parameter: name.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for command in &self.commands {
            for name in placeholders(command) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Operation name to per-vendor command templates.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable {
    operations: BTreeMap<String, BTreeMap<VendorId, Template>>,
}

impl TranslationTable {
    pub fn from_document(doc: TranslationDocument) -> Result<Self, SwitchError> {
        let mut operations = BTreeMap::new();
        for (operation, vendors) in doc.operations {
            let mut templates = BTreeMap::new();
            for (vendor, template) in vendors {
                let vendor = VendorId::new(vendor);
                let compiled = Template::compile(&operation, vendor.as_str(), template)?;
                templates.insert(vendor, compiled);
            }
            operations.insert(operation, templates);
        }
        Ok(Self { operations })
    }

    pub fn from_json(json: &str) -> Result<Self, SwitchError> {
        let doc: TranslationDocument = serde_json::from_str(json).map_err(|e| {
            SwitchError::InternalServerError(format!("decode translation table: {e}"))
        })?;
        Self::from_document(doc)
    }

    /// Shared handle to the built-in table.
    pub fn builtin() -> Arc<TranslationTable> {
        BUILTIN_TABLE.clone()
    }

    /// Operation names in lexicographic order.
    pub fn operations(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    /// Vendors that have a template for `operation`.
    pub fn vendors_for(&self, operation: &str) -> Result<Vec<VendorId>, SwitchError> {
        self.entry(operation).map(|vendors| vendors.keys().cloned().collect())
    }

    /// Placeholder names the vendor's template needs.
    pub fn required_parameters(
        &self,
        operation: &str,
        vendor: &VendorId,
    ) -> Result<Vec<String>, SwitchError> {
        self.template(operation, vendor).map(Template::parameters)
    }

    fn entry(&self, operation: &str) -> Result<&BTreeMap<VendorId, Template>, SwitchError> {
        self.operations
            .get(operation)
            .ok_or_else(|| SwitchError::UnknownOperation(operation.to_string()))
    }

    fn template(&self, operation: &str, vendor: &VendorId) -> Result<&Template, SwitchError> {
        self.entry(operation)?
            .get(vendor)
            .ok_or_else(|| SwitchError::OperationNotSupported {
                operation: operation.to_string(),
                vendor: vendor.clone(),
            })
    }

    /// Renders `operation` for `vendor`, keeping the required mode.
    pub fn render_operation(
        &self,
        operation: &str,
        vendor: &VendorId,
        params: &Params,
    ) -> Result<RenderedOperation, SwitchError> {
        let template = self.template(operation, vendor)?;
        template.check_values(operation, params)?;
        let commands = template
            .commands
            .iter()
            .map(|command| {
                render_template(command, params).map_err(|parameter| {
                    SwitchError::MissingParameter {
                        operation: operation.to_string(),
                        parameter,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RenderedOperation {
            operation: operation.to_string(),
            vendor: vendor.clone(),
            commands,
            mode: template.mode,
        })
    }

    pub fn translate_operation(
        &self,
        operation: &str,
        vendor: &VendorId,
        params: &Params,
    ) -> Result<Vec<String>, SwitchError> {
        self.render_operation(operation, vendor, params)
            .map(|rendered| rendered.commands)
    }

    /// Finds the operation whose `vendor` template matches `observed`
    /// structurally. Most literal text wins, then the first name.
    pub fn identify(&self, vendor: &VendorId, observed: &[String]) -> Option<OperationMatch> {
        let mut best: Option<(usize, &str, Params)> = None;
        for (operation, templates) in &self.operations {
            let Some(template) = templates.get(vendor) else {
                continue;
            };
            let Some(params) = template.bind(observed) else {
                continue;
            };
            let better = match &best {
                Some((len, _, _)) => template.literal_len > *len,
                None => true,
            };
            if better {
                best = Some((template.literal_len, operation.as_str(), params));
            }
        }
        best.map(|(_, operation, params)| OperationMatch {
            operation: operation.to_string(),
            params,
        })
    }
}

/// Translator bound to a vendor registry and a table.
#[derive(Debug, Clone)]
pub struct Translator {
    registry: Arc<VendorRegistry>,
    table: Arc<TranslationTable>,
}

impl Translator {
    pub fn new(registry: Arc<VendorRegistry>, table: Arc<TranslationTable>) -> Self {
        Self { registry, table }
    }

    /// Built-in vendors with the built-in table.
    pub fn with_builtins() -> Self {
        Self::new(BUILTIN_REGISTRY.clone(), TranslationTable::builtin())
    }

    pub fn table(&self) -> &TranslationTable {
        &self.table
    }

    fn ensure_registered(&self, vendor: &VendorId) -> Result<(), SwitchError> {
        if self.registry.contains(vendor) {
            Ok(())
        } else {
            Err(SwitchError::VendorNotRegistered(vendor.clone()))
        }
    }

    pub fn render_operation(
        &self,
        operation: &str,
        target: &VendorId,
        params: &Params,
    ) -> Result<RenderedOperation, SwitchError> {
        self.ensure_registered(target)?;
        self.table.render_operation(operation, target, params)
    }

    pub fn translate_operation(
        &self,
        operation: &str,
        target: &VendorId,
        params: &Params,
    ) -> Result<Vec<String>, SwitchError> {
        self.render_operation(operation, target, params)
            .map(|rendered| rendered.commands)
    }

    /// Recognises the operation behind `commands` in the source dialect.
    /// Aliases of the source vendor are expanded first.
    pub fn identify<S: AsRef<str>>(
        &self,
        source: &VendorId,
        commands: &[S],
    ) -> Result<OperationMatch, SwitchError> {
        let profile = self.registry.profile(source)?;
        let observed = commands
            .iter()
            .map(|c| classify::normalize(&profile, c.as_ref()))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        self.table
            .identify(source, &observed)
            .ok_or_else(|| SwitchError::NoEquivalentFound {
                command: observed.join("\n"),
                source_vendor: source.clone(),
            })
    }

    /// Translates one command, or a newline separated sequence, between
    /// dialects.
    pub fn translate_command(
        &self,
        source: &VendorId,
        target: &VendorId,
        command: &str,
    ) -> Result<Vec<String>, SwitchError> {
        let lines = command.lines().collect::<Vec<_>>();
        self.translate_commands(source, target, &lines)
    }

    pub fn translate_commands<S: AsRef<str>>(
        &self,
        source: &VendorId,
        target: &VendorId,
        commands: &[S],
    ) -> Result<Vec<String>, SwitchError> {
        self.ensure_registered(target)?;
        let found = self.identify(source, commands)?;
        debug!(
            "{} commands identified as {} for {}",
            source, found.operation, target
        );
        self.table
            .translate_operation(&found.operation, target, &found.params)
    }
}
