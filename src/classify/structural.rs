//! Lightweight structural merge for trivially resolvable textual conflicts:
//! whitespace-only divergence and insertion-only edits. Both sides'
//! inserted blocks are kept whole, even when they share lines.

use similar::{DiffTag, TextDiff};

fn normalized(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

fn terminated(content: &str) -> String {
    let mut text = content.to_string();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// For each gap around the base lines, the block a side inserted there.
/// `None` when the side deleted or rewrote any base line.
fn insertions<'a>(base: &'a str, side: &'a str) -> Option<Vec<Vec<&'a str>>> {
    let diff = TextDiff::from_lines(base, side);
    let mut gaps = vec![Vec::new(); diff.old_slices().len() + 1];
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Equal => {}
            DiffTag::Insert => gaps[old_range.start].extend_from_slice(&diff.new_slices()[new_range]),
            DiffTag::Delete | DiffTag::Replace => return None,
        }
    }
    Some(gaps)
}

/// Merge two divergent versions of one file, or `None` when the divergence
/// needs real reasoning.
pub fn resolve(base: Option<&str>, ours: Option<&str>, theirs: Option<&str>) -> Option<String> {
    let (ours, theirs) = match (ours, theirs) {
        (Some(ours), Some(theirs)) => (ours, theirs),
        (None, None) => return None,
        _ => return None,
    };
    if ours == theirs {
        return Some(ours.to_string());
    }
    if normalized(ours) == normalized(theirs) {
        return Some(ours.to_string());
    }

    let Some(base) = base else {
        if theirs.starts_with(ours) {
            return Some(theirs.to_string());
        }
        if ours.starts_with(theirs) {
            return Some(ours.to_string());
        }
        return None;
    };

    let (base, ours_text, theirs_text) = (terminated(base), terminated(ours), terminated(theirs));
    let ours_gaps = insertions(&base, &ours_text)?;
    let theirs_gaps = insertions(&base, &theirs_text)?;
    let base_lines: Vec<&str> = base.split_inclusive('\n').collect();

    let mut merged = String::new();
    for gap in 0..=base_lines.len() {
        let (o, t) = (&ours_gaps[gap], &theirs_gaps[gap]);
        merged.extend(o.iter().copied());
        if o != t {
            merged.extend(t.iter().copied());
        }
        if gap < base_lines.len() {
            merged.push_str(base_lines[gap]);
        }
    }
    if !ours.ends_with('\n') && !theirs.ends_with('\n') && merged.ends_with('\n') {
        merged.pop();
    }
    Some(merged)
}

/// Fold several member versions of one file against the base
pub fn resolve_many(base: Option<&str>, versions: &[Option<&str>]) -> Option<String> {
    let mut iter = versions.iter();
    let first = iter.next()?;
    let mut current: Option<String> = first.map(str::to_string);
    for next in iter {
        current = Some(resolve(base, current.as_deref(), *next)?);
    }
    current
}
