//! Unified diff application with context verification.
//!
//! Hunks are applied in order. Each hunk's context and removed lines must
//! match the current text exactly; the hunk header position is tried first,
//! then the nearest matching position after the previous hunk.

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    /// 0-based start line in the original text.
    old_start: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
            HunkLine::Remove(_) => None,
        })
    }
}

/// Apply a unified diff to `original`. Errors describe the first hunk that
/// does not apply.
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<String, String> {
    let hunks = parse_hunks(diff)?;
    if hunks.is_empty() {
        return Err("diff contains no hunks".into());
    }

    let source: Vec<&str> = original.lines().collect();
    let mut output: Vec<&str> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;

    for (n, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let pos = find_hunk(&source, &old, hunk.old_start, cursor)
            .ok_or_else(|| format!("hunk {} context does not match", n + 1))?;

        output.extend_from_slice(&source[cursor..pos]);
        output.extend(hunk.new_lines());
        cursor = pos + old.len();
    }
    output.extend_from_slice(&source[cursor..]);

    let mut result = output.join("\n");
    let keep_newline = original.ends_with('\n') || original.is_empty();
    if keep_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn find_hunk(source: &[&str], old: &[&str], hinted: usize, cursor: usize) -> Option<usize> {
    let matches_at = |pos: usize| {
        pos + old.len() <= source.len() && source[pos..pos + old.len()] == *old
    };

    if hinted >= cursor && matches_at(hinted) {
        return Some(hinted);
    }
    if source.len() < old.len() {
        return None;
    }
    // nearest match to the hinted line, not before the previous hunk
    (cursor..=source.len() - old.len())
        .filter(|&pos| matches_at(pos))
        .min_by_key(|&pos| pos.abs_diff(hinted))
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, String> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut lines = diff.lines().peekable();

    while let Some(line) = lines.next() {
        if let Some(header) = line.strip_prefix("@@") {
            hunks.extend(current.take());
            current = Some(Hunk {
                old_start: parse_old_start(header)?,
                lines: Vec::new(),
            });
            continue;
        }

        // a `---`/`+++` pair or `diff` line starts the next file section
        let file_header = line.starts_with("diff ")
            || (line.starts_with("--- ") && lines.peek().is_some_and(|n| n.starts_with("+++ ")));
        if file_header {
            hunks.extend(current.take());
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            continue;
        };
        match line.chars().next() {
            Some('+') => hunk.lines.push(HunkLine::Add(line[1..].to_string())),
            Some('-') => hunk.lines.push(HunkLine::Remove(line[1..].to_string())),
            Some(' ') => hunk.lines.push(HunkLine::Context(line[1..].to_string())),
            Some('\\') => {}
            // some models drop the leading space on blank context lines
            None => hunk.lines.push(HunkLine::Context(String::new())),
            Some(_) => return Err(format!("unexpected diff line: {line}")),
        }
    }

    hunks.extend(current);
    Ok(hunks)
}

/// `" -12,5 +12,6 @@"` -> 11. A start of 0 (new file) maps to 0.
fn parse_old_start(header: &str) -> Result<usize, String> {
    let old = header
        .split_whitespace()
        .find_map(|part| part.strip_prefix('-'))
        .ok_or_else(|| format!("malformed hunk header: @@{header}"))?;
    let start = old.split(',').next().unwrap_or("0");
    let start: usize = start
        .parse()
        .map_err(|_| format!("malformed hunk header: @@{header}"))?;
    Ok(start.saturating_sub(1))
}
