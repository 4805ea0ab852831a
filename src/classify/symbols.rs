use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static RUST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*pub(?:\([^)]*\))?\s+(?:async\s+|const\s+|unsafe\s+)*(fn|struct|enum|trait|type|const|static)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid rust item pattern")
});

static JS_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*export\s+(?:default\s+)?(?:async\s+)?(function|const|let|class|interface|type|enum)\s+([A-Za-z_$][A-Za-z0-9_$]*)")
        .expect("valid export pattern")
});

static PY_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?(def|class)\s+([A-Za-z][A-Za-z0-9_]*)").expect("valid python pattern"));

static GO_FUNC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^func\s+(?:\([^)]*\)\s*)?([A-Z][A-Za-z0-9_]*)").expect("valid go pattern")
});

/// Exported definitions in one file: symbol name to normalized signature line
pub fn extract_signatures(path: &str, content: &str) -> BTreeMap<String, String> {
    let mut signatures = BTreeMap::new();
    let extension = path.rsplit('.').next().unwrap_or_default();

    for line in content.lines() {
        let name = match extension {
            "rs" => RUST_ITEM.captures(line).map(|c| c[2].to_string()),
            "js" | "jsx" | "ts" | "tsx" | "mjs" => JS_EXPORT.captures(line).map(|c| c[2].to_string()),
            "py" => PY_DEF.captures(line).map(|c| c[2].to_string()),
            "go" => GO_FUNC.captures(line).map(|c| c[1].to_string()),
            _ => None,
        };
        if let Some(name) = name {
            signatures.entry(name).or_insert_with(|| normalize_signature(line));
        }
    }
    signatures
}

/// Signature text up to the body, with whitespace collapsed
pub fn normalize_signature(line: &str) -> String {
    let head = line.split('{').next().unwrap_or(line);
    let head = head.trim_end().trim_end_matches(':');
    head.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Symbols added or whose signature changed between two versions of a file
pub fn changed_symbols(path: &str, before: Option<&str>, after: Option<&str>) -> BTreeSet<String> {
    let before = before.map(|c| extract_signatures(path, c)).unwrap_or_default();
    let after = after.map(|c| extract_signatures(path, c)).unwrap_or_default();

    let mut changed = BTreeSet::new();
    for (name, signature) in &after {
        if before.get(name) != Some(signature) {
            changed.insert(name.clone());
        }
    }
    for name in before.keys() {
        if !after.contains_key(name) {
            changed.insert(name.clone());
        }
    }
    changed
}

/// Occurrences of `symbol(` or `symbol::` that are not definitions
pub fn count_call_sites(symbol: &str, content: &str) -> usize {
    let escaped = regex::escape(symbol);
    let Ok(call) = Regex::new(&format!(r"\b{escaped}\s*(\(|::|<)")) else {
        return 0;
    };
    content
        .lines()
        .filter(|line| {
            let definition = RUST_ITEM.is_match(line)
                || JS_EXPORT.is_match(line)
                || PY_DEF.is_match(line)
                || GO_FUNC.is_match(line);
            !definition
        })
        .map(|line| call.find_iter(line).count())
        .sum()
}
