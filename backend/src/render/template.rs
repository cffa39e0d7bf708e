use crate::render::{RenderError, SlipData};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `{{ field }}`; names are letters, digits and underscores.
    RE.get_or_init(|| Regex::new(r"\{\{\s*([\p{L}\p{N}_]+)\s*\}\}").expect("static regex"))
}

/// A slip layout with `{{field}}` placeholders, kept in the converter's
/// source format (a flat `.fods` sheet by default).
#[derive(Debug, Clone)]
pub struct SlipTemplate {
    /// File extension handed to the converter, e.g. `fods`.
    extension: String,
    body: String,
    digest: String,
}

impl SlipTemplate {
    pub fn new(file_name: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("fods")
            .to_string();
        let digest = format!("{:x}", md5::compute(body.as_bytes()));
        Self {
            extension,
            body,
            digest,
        }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let body = fs::read_to_string(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("template.fods");
        Ok(Self::new(name, body))
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Field names the template references.
    pub fn placeholders(&self) -> BTreeSet<String> {
        placeholder_re()
            .captures_iter(&self.body)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Substitutes every placeholder. Fails if any referenced field is missing
    /// or blank, so a slip never goes out with empty cells.
    pub fn fill(&self, data: &SlipData) -> Result<String, RenderError> {
        let missing: Vec<String> = self
            .placeholders()
            .into_iter()
            .filter(|name| data.get(name).is_none_or(|v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(RenderError::Template(format!(
                "missing values for: {}",
                missing.join(", ")
            )));
        }

        let filled = placeholder_re().replace_all(&self.body, |caps: &regex::Captures| {
            data.get(&caps[1]).map(|v| escape_xml(v)).unwrap_or_default()
        });
        Ok(filled.into_owned())
    }
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}
