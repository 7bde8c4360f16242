//! Structured style records and the class registry.
//!
//! Styles are compile-time constants. The compiler evaluates `Style(...)` and
//! `merge(a, b)` itself, registers the result, and stores only the generated class
//! name in the `CREATE_NODE` instruction.

use std::{borrow::Cow, fmt, fmt::Write as _};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A length in pixels or as a percentage of the parent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Length {
    Px(f64),
    Percent(f64),
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (n, unit) = match self {
            Self::Px(n) => (*n, "px"),
            Self::Percent(n) => (*n, "%"),
        };
        if n.fract() == 0.0 && n.is_finite() {
            write!(f, "{n:.0}{unit}")
        } else {
            write!(f, "{}{unit}", ryu::Buffer::new().format(n))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Align {
    Start,
    Center,
    End,
    Stretch,
}

/// A literal value passed to `Style(...)`.
#[derive(Debug, Clone, PartialEq)]
pub enum StyleValue {
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleError(pub Cow<'static, str>);

impl fmt::Display for StyleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StyleError {}

/// Style properties, one optional field each. `None` means "not set", which is
/// what lets [`merge`] be total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub color: Option<String>,
    pub background: Option<String>,
    pub padding: Option<Length>,
    pub margin: Option<Length>,
    pub gap: Option<Length>,
    pub width: Option<Length>,
    pub height: Option<Length>,
    pub font_size: Option<Length>,
    pub font_weight: Option<String>,
    pub border_radius: Option<Length>,
    pub align: Option<Align>,
}

impl Style {
    /// Sets one property from its keyword name.
    pub fn set(&mut self, property: &str, value: StyleValue) -> Result<(), StyleError> {
        match property {
            "color" => self.color = Some(text(property, value)?),
            "background" => self.background = Some(text(property, value)?),
            "font_weight" => self.font_weight = Some(text(property, value)?),
            "padding" => self.padding = Some(length(property, value)?),
            "margin" => self.margin = Some(length(property, value)?),
            "gap" => self.gap = Some(length(property, value)?),
            "width" => self.width = Some(length(property, value)?),
            "height" => self.height = Some(length(property, value)?),
            "font_size" => self.font_size = Some(length(property, value)?),
            "border_radius" => self.border_radius = Some(length(property, value)?),
            "align" => {
                let name = text(property, value)?;
                let align = name
                    .parse()
                    .map_err(|_| StyleError(format!("invalid align '{name}'").into()))?;
                self.align = Some(align);
            }
            other => return Err(StyleError(format!("unknown style property '{other}'").into())),
        }
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// CSS declarations in a fixed property order.
    fn declarations(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let mut push = |name: &'static str, value: Option<String>| {
            if let Some(value) = value {
                out.push((name, value));
            }
        };
        push("color", self.color.clone());
        push("background", self.background.clone());
        push("padding", self.padding.map(|l| l.to_string()));
        push("margin", self.margin.map(|l| l.to_string()));
        push("gap", self.gap.map(|l| l.to_string()));
        push("width", self.width.map(|l| l.to_string()));
        push("height", self.height.map(|l| l.to_string()));
        push("font-size", self.font_size.map(|l| l.to_string()));
        push("font-weight", self.font_weight.clone());
        push("border-radius", self.border_radius.map(|l| l.to_string()));
        push("align-items", self.align.map(|a| a.to_string()));
        out
    }

    /// Normalised content signature: equal styles produce equal signatures regardless
    /// of the order properties were written in.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut signature = String::new();
        for (name, value) in self.declarations() {
            let _ = write!(signature, "{name}:{value};");
        }
        signature
    }
}

fn text(property: &str, value: StyleValue) -> Result<String, StyleError> {
    match value {
        StyleValue::Str(s) => Ok(s),
        StyleValue::Number(_) => Err(StyleError(format!("style property '{property}' expects a string").into())),
    }
}

/// Numbers are pixels; strings may be `"12px"` or `"50%"`.
fn length(property: &str, value: StyleValue) -> Result<Length, StyleError> {
    let invalid = || StyleError(format!("invalid length for '{property}'").into());
    match value {
        StyleValue::Number(n) if n.is_finite() => Ok(Length::Px(n)),
        StyleValue::Number(_) => Err(invalid()),
        StyleValue::Str(s) => {
            let s = s.trim();
            if let Some(n) = s.strip_suffix('%') {
                n.trim().parse().map(Length::Percent).map_err(|_| invalid())
            } else {
                s.strip_suffix("px")
                    .unwrap_or(s)
                    .trim()
                    .parse()
                    .map(Length::Px)
                    .map_err(|_| invalid())
            }
        }
    }
}

/// Field-by-field merge. Every field set in `over` wins; unset fields fall back
/// to `base`.
#[must_use]
pub fn merge(base: &Style, over: &Style) -> Style {
    Style {
        color: over.color.clone().or_else(|| base.color.clone()),
        background: over.background.clone().or_else(|| base.background.clone()),
        padding: over.padding.or(base.padding),
        margin: over.margin.or(base.margin),
        gap: over.gap.or(base.gap),
        width: over.width.or(base.width),
        height: over.height.or(base.height),
        font_size: over.font_size.or(base.font_size),
        font_weight: over.font_weight.clone().or_else(|| base.font_weight.clone()),
        border_radius: over.border_radius.or(base.border_radius),
        align: over.align.or(base.align),
    }
}

/// A registered class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleClass {
    pub name: String,
    pub style: Style,
}

/// Deduplicating registry from style content to generated class names.
///
/// Insertion ordered so the CSS output is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleRegistry {
    classes: IndexMap<String, StyleClass>,
}

impl StyleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the class name for `style`, registering it on first sight.
    pub fn register(&mut self, style: &Style) -> &str {
        let signature = style.signature();
        let entry = self.classes.entry(signature).or_insert_with_key(|signature| StyleClass {
            name: class_name(signature),
            style: style.clone(),
        });
        &entry.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> impl Iterator<Item = &StyleClass> {
        self.classes.values()
    }

    /// Stylesheet text for every registered class.
    #[must_use]
    pub fn css(&self) -> String {
        let mut css = String::new();
        for class in self.classes.values() {
            let _ = write!(css, ".{} {{", class.name);
            for (name, value) in class.style.declarations() {
                let _ = write!(css, " {name}: {value};");
            }
            css.push_str(" }\n");
        }
        css
    }
}

fn class_name(signature: &str) -> String {
    let digest = Sha256::digest(signature.as_bytes());
    let mut name = String::from("r-");
    for byte in &digest[..4] {
        let _ = write!(name, "{byte:02x}");
    }
    name
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn style(props: &[(&str, StyleValue)]) -> Style {
        let mut style = Style::default();
        for (name, value) in props {
            style.set(name, value.clone()).unwrap();
        }
        style
    }

    #[test]
    fn merge_right_wins() {
        let base = style(&[
            ("color", StyleValue::Str("red".into())),
            ("padding", StyleValue::Number(4.0)),
        ]);
        let over = style(&[("color", StyleValue::Str("blue".into()))]);
        let merged = merge(&base, &over);
        assert_eq!(merged.color.as_deref(), Some("blue"));
        assert_eq!(merged.padding, Some(Length::Px(4.0)));
    }

    #[test]
    fn registry_deduplicates_by_content() {
        let a = style(&[
            ("color", StyleValue::Str("red".into())),
            ("gap", StyleValue::Number(8.0)),
        ]);
        let b = style(&[
            ("gap", StyleValue::Str("8px".into())),
            ("color", StyleValue::Str("red".into())),
        ]);
        let mut registry = StyleRegistry::new();
        let first = registry.register(&a).to_owned();
        let second = registry.register(&b).to_owned();
        assert_eq!(first, second);
        assert!(first.starts_with("r-") && first.len() == 10, "{first}");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.css(), format!(".{first} {{ color: red; gap: 8px; }}\n"));
    }

    #[test]
    fn bad_properties_are_rejected() {
        let mut s = Style::default();
        assert!(s.set("colour", StyleValue::Str("red".into())).is_err());
        assert!(s.set("width", StyleValue::Str("wide".into())).is_err());
        assert!(s.set("align", StyleValue::Str("middle".into())).is_err());
        s.set("width", StyleValue::Str("50%".into())).unwrap();
        assert_eq!(s.width, Some(Length::Percent(50.0)));
    }
}
