use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Placeholder the user input is substituted into.
pub const INPUT_PLACEHOLDER: &str = "{{input}}";

/// Named values substituted into `{{name}}` placeholders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateVars(BTreeMap<String, String>);

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Renders a template against variables. Must be pure.
pub trait TemplateFiller: Send + Sync {
    fn fill(&self, template: &str, vars: &TemplateVars) -> String;
}

/// Replaces `{{ name }}` with the named variable. Unknown placeholders are
/// left untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaceholderFiller;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

impl TemplateFiller for PlaceholderFiller {
    fn fill(&self, template: &str, vars: &TemplateVars) -> String {
        placeholder_re()
            .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

/// Apply a user-input template. A template without an input placeholder gets
/// one appended on its own line; no template returns the input unchanged.
pub fn fill_input_template(
    filler: &dyn TemplateFiller,
    template: Option<&str>,
    input: &str,
    vars: &TemplateVars,
) -> String {
    let Some(template) = template.filter(|t| !t.trim().is_empty()) else {
        return input.to_string();
    };
    let template = if template.contains(INPUT_PLACEHOLDER) {
        template.to_string()
    } else {
        format!("{template}\n{INPUT_PLACEHOLDER}")
    };
    filler.fill(&template, &vars.clone().with("input", input))
}
