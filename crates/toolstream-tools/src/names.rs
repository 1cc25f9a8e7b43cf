/// Canonical form used to compare tool names: lowercase snake case, with
/// `-`, spaces and camelCase boundaries folded to `_`.
pub fn normalize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.trim().chars() {
        if ch == '-' || ch == ' ' || ch == '_' || ch == '.' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() {
            if prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out.trim_end_matches('_').to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResolution {
    /// The name is registered as given.
    Exact(String),
    /// The name matches exactly one registered tool after normalization.
    Normalized(String),
    /// Several registered tools share the normalized form.
    Ambiguous(Vec<String>),
    Unknown,
}

impl ToolResolution {
    pub fn resolved_name(&self) -> Option<&str> {
        match self {
            ToolResolution::Exact(name) | ToolResolution::Normalized(name) => Some(name),
            _ => None,
        }
    }
}

pub fn resolve_tool_name<'a, I>(requested: &str, available: I) -> ToolResolution
where
    I: IntoIterator<Item = &'a str>,
{
    let target = normalize_tool_name(requested);
    let mut matches = Vec::new();
    for name in available {
        if name == requested {
            return ToolResolution::Exact(name.to_string());
        }
        if normalize_tool_name(name) == target {
            matches.push(name.to_string());
        }
    }
    match matches.len() {
        0 => ToolResolution::Unknown,
        1 => ToolResolution::Normalized(matches.remove(0)),
        _ => ToolResolution::Ambiguous(matches),
    }
}
