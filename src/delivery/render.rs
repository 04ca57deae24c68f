//! Payload rendering and filter evaluation
//!
//! The pipeline only needs `{chunks, passed}` back from a renderer. The
//! default [`TemplateRenderer`] evaluates the subscription's include/exclude
//! rules, renders its Handlebars template and splits the result to fit the
//! platform message size.

use std::collections::HashMap;
use std::sync::Mutex;

use handlebars::Handlebars;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use super::DeliveryError;
use crate::models::{FetchedItem, FilterRules, Subscription};

/// Template used when a subscription has none
pub const DEFAULT_TEMPLATE: &str = "{{title}}\n{{link}}";

/// Platform limit on one message body
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2000;

/// Renderer output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub chunks: Vec<String>,
    pub passed: bool,
}

/// Turns an item into outbound message bodies for one subscription
pub trait ArticleRenderer: Send + Sync {
    fn render(&self, item: &FetchedItem, subscription: &Subscription) -> Result<Rendered, DeliveryError>;
}

/// Handlebars + regex filter renderer
pub struct TemplateRenderer {
    handlebars: Handlebars<'static>,
    max_length: usize,
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl TemplateRenderer {
    pub fn new(max_length: usize) -> Self {
        let mut handlebars = Handlebars::new();
        // Messages are plain text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            handlebars,
            max_length: max_length.max(1),
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `item` passes the filter rules
    ///
    /// With include rules present at least one must match. Any matching
    /// exclude rule blocks the item.
    pub fn passes(&self, item: &FetchedItem, rules: &FilterRules) -> bool {
        let has_includes = rules.include.values().any(|p| !p.is_empty());
        let included = !has_includes
            || rules
                .include
                .iter()
                .any(|(field, patterns)| self.any_match(item, field, patterns));
        let excluded = rules
            .exclude
            .iter()
            .any(|(field, patterns)| self.any_match(item, field, patterns));
        included && !excluded
    }

    fn any_match(&self, item: &FetchedItem, field: &str, patterns: &[String]) -> bool {
        let Some(value) = item.raw.field(field) else {
            return false;
        };
        patterns.iter().any(|pattern| self.matches(pattern, &value))
    }

    fn matches(&self, pattern: &str, value: &str) -> bool {
        let compiled = match self.patterns.lock() {
            Ok(mut cache) => cache
                .entry(pattern.to_string())
                .or_insert_with(|| compile_pattern(pattern))
                .clone(),
            Err(_) => compile_pattern(pattern),
        };
        match compiled {
            Some(regex) => regex.is_match(value),
            None => value.to_lowercase().contains(&pattern.to_lowercase()),
        }
    }

    fn template_data(item: &FetchedItem) -> Value {
        let raw = &item.raw;
        let mut data = Map::new();
        data.insert("id".to_string(), Value::String(item.id.clone()));
        for (key, value) in [
            ("guid", &raw.guid),
            ("link", &raw.link),
            ("title", &raw.title),
            ("description", &raw.description),
            ("author", &raw.author),
        ] {
            data.insert(
                key.to_string(),
                Value::String(value.clone().unwrap_or_default()),
            );
        }
        data.insert(
            "published".to_string(),
            Value::String(raw.published.map(|d| d.to_rfc3339()).unwrap_or_default()),
        );
        for (key, value) in &raw.extra {
            data.entry(key.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        Value::Object(data)
    }
}

impl ArticleRenderer for TemplateRenderer {
    fn render(&self, item: &FetchedItem, subscription: &Subscription) -> Result<Rendered, DeliveryError> {
        if !self.passes(item, &subscription.filters) {
            return Ok(Rendered {
                chunks: Vec::new(),
                passed: false,
            });
        }

        let template = subscription.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        let text = self
            .handlebars
            .render_template(template, &Self::template_data(item))
            .map_err(|e| DeliveryError::Render(e.to_string()))?;

        Ok(Rendered {
            chunks: split_message(text.trim(), self.max_length),
            passed: true,
        })
    }
}

/// Case-insensitive regex, or a literal match for invalid expressions
fn compile_pattern(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            RegexBuilder::new(&regex::escape(pattern))
                .case_insensitive(true)
                .build()
        })
        .ok()
}

/// Split `text` into chunks of at most `max_chars` characters
///
/// Prefers line breaks, then spaces, then a hard cut.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.chars().count() <= max_chars {
            chunks.push(rest.to_string());
            break;
        }

        // Byte offset of the first character past the limit
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..limit];

        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}
