//! Textual amendment of `//go:build` constraint lines.

/// Amend a file's build constraint with `tag`.
///
/// With an operator (`||` or `&&`) the tag extends the existing
/// `//go:build` line; with an empty operator the whole line is replaced by
/// `//go:build <tag>`. A file without a constraint line gets one prepended.
/// Legacy `// +build` lines are dropped so the rewritten header has a
/// single source of truth.
pub fn append_build_tag(src: &str, tag: &str, op: &str, notice: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut amended = false;

    for line in src.lines() {
        let trimmed = line.trim_start();
        if !amended && trimmed.starts_with("//go:build") {
            if op.is_empty() {
                lines.push(format!("//go:build {tag}"));
            } else {
                lines.push(format!("{line} {op} {tag}"));
            }
            lines.push(format!("// {notice}"));
            amended = true;
            continue;
        }
        if is_plus_build_line(trimmed) {
            continue;
        }
        lines.push(line.to_string());
    }

    if !amended {
        let mut header = vec![
            format!("//go:build {tag}"),
            format!("// {notice}"),
            String::new(),
        ];
        header.extend(lines);
        lines = header;
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn is_plus_build_line(line: &str) -> bool {
    let Some(rest) = line.strip_prefix("//") else {
        return false;
    };
    let rest = rest.trim_start();
    rest == "+build" || rest.starts_with("+build ")
}
