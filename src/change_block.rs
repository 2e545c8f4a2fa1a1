//! Recovers a commit message, optional branch and complete file contents from a
//! free-form assistant reply.
//!
//! The reply is scanned line by line. Outside file bodies, fenced code is skipped so
//! that header-looking lines inside examples are ignored. Each `FILE:` header takes
//! either the fenced block that follows it or, without a fence, every line up to the
//! next header, commit or branch line.

use crate::constants::{CHANGES_APPLIED_PLACEHOLDER, DEFAULT_COMMIT_MESSAGE};
use crate::types::ChangeSet;
use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    FileHeader(String),
    Commit(String),
    Branch(String),
}

#[derive(Debug)]
struct FileEntry {
    header_line: usize,
    path: String,
    content: String,
}

#[derive(Debug, Default)]
struct Scan {
    files: Vec<FileEntry>,
    commits: Vec<(usize, String)>,
    branches: Vec<(usize, String)>,
}

enum State<'a> {
    Prose {
        in_fence: bool,
    },
    AwaitingBody {
        path: String,
        header_line: usize,
    },
    FencedBody {
        path: String,
        header_line: usize,
        depth: usize,
        body: Vec<&'a str>,
    },
    PlainBody {
        path: String,
        header_line: usize,
        in_fence: bool,
        body: Vec<&'a str>,
    },
}

const LEADING_DECORATION: &[char] = &['*', '_', '`', '#', '>', '-', ' ', '\t'];
const VALUE_DECORATION: &[char] = &['*', '_', '`', '"', '\'', ' ', '\t'];

/// `Some(info)` for a fence line; `info` is empty for a bare fence.
fn fence_info(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some(trimmed.trim_start_matches('`').trim())
    } else if trimmed.starts_with("~~~") {
        Some(trimmed.trim_start_matches('~').trim())
    } else {
        None
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim().trim_matches(VALUE_DECORATION).trim().to_string()
}

fn is_placeholder(value: &str) -> bool {
    value.is_empty() || (value.starts_with('<') && value.ends_with('>'))
}

fn normalize_path(value: &str) -> Option<String> {
    let token = value.split_whitespace().next()?;
    let mut path = token.trim_matches(VALUE_DECORATION);
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    let path = path.trim_start_matches('/');
    if path.is_empty() || path.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(path.to_string())
}

fn classify_marker(line: &str) -> Option<Marker> {
    let core = line.trim().trim_start_matches(LEADING_DECORATION);
    let (label, rest) = core.split_once(':')?;
    let label = label.trim().trim_end_matches(['*', '_', '`']).trim().to_lowercase();
    match label.as_str() {
        "file" | "file path" | "filepath" => normalize_path(&clean_value(rest)).map(Marker::FileHeader),
        "commit message" | "commit" | "commit msg" => Some(Marker::Commit(clean_value(rest))),
        "branch" | "branch name" => Some(Marker::Branch(clean_value(rest))),
        _ => None,
    }
}

fn finish_body(body: &[&str]) -> String {
    let end = body
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|p| p + 1)
        .unwrap_or(0);
    body[..end].join("\n")
}

fn scan(lines: &[&str]) -> Scan {
    let mut scan = Scan::default();
    let mut state = State::Prose { in_fence: false };
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        state = match state {
            State::Prose { in_fence } => {
                i += 1;
                if fence_info(line).is_some() {
                    State::Prose {
                        in_fence: !in_fence,
                    }
                } else if in_fence {
                    State::Prose { in_fence }
                } else {
                    match classify_marker(line) {
                        Some(Marker::FileHeader(path)) => State::AwaitingBody {
                            path,
                            header_line: i - 1,
                        },
                        Some(Marker::Commit(value)) => {
                            scan.commits.push((i - 1, value));
                            State::Prose { in_fence: false }
                        }
                        Some(Marker::Branch(value)) => {
                            scan.branches.push((i - 1, value));
                            State::Prose { in_fence: false }
                        }
                        None => State::Prose { in_fence: false },
                    }
                }
            }
            State::AwaitingBody { path, header_line } => {
                if line.trim().is_empty() {
                    i += 1;
                    State::AwaitingBody { path, header_line }
                } else if fence_info(line).is_some() {
                    i += 1;
                    State::FencedBody {
                        path,
                        header_line,
                        depth: 1,
                        body: Vec::new(),
                    }
                } else if classify_marker(line).is_some() {
                    // Header with no body is only a mention; the marker is handled as prose.
                    tracing::debug!("Ignoring header for {} without a body", path);
                    State::Prose { in_fence: false }
                } else {
                    State::PlainBody {
                        path,
                        header_line,
                        in_fence: false,
                        body: Vec::new(),
                    }
                }
            }
            State::FencedBody {
                path,
                header_line,
                depth,
                mut body,
            } => {
                i += 1;
                match fence_info(line) {
                    Some(info) if !info.is_empty() => {
                        body.push(line);
                        State::FencedBody {
                            path,
                            header_line,
                            depth: depth + 1,
                            body,
                        }
                    }
                    Some(_) if depth > 1 => {
                        body.push(line);
                        State::FencedBody {
                            path,
                            header_line,
                            depth: depth - 1,
                            body,
                        }
                    }
                    Some(_) => {
                        scan.files.push(FileEntry {
                            header_line,
                            path,
                            content: body.join("\n"),
                        });
                        State::Prose { in_fence: false }
                    }
                    None => {
                        body.push(line);
                        State::FencedBody {
                            path,
                            header_line,
                            depth,
                            body,
                        }
                    }
                }
            }
            State::PlainBody {
                path,
                header_line,
                in_fence,
                mut body,
            } => {
                if !in_fence && classify_marker(line).is_some() {
                    scan.files.push(FileEntry {
                        header_line,
                        path,
                        content: finish_body(&body),
                    });
                    State::Prose { in_fence: false }
                } else {
                    i += 1;
                    let in_fence = if fence_info(line).is_some() {
                        !in_fence
                    } else {
                        in_fence
                    };
                    body.push(line);
                    State::PlainBody {
                        path,
                        header_line,
                        in_fence,
                        body,
                    }
                }
            }
        };
    }

    match state {
        State::Prose { .. } => {}
        State::AwaitingBody { path, .. } => {
            tracing::debug!("Ignoring trailing header for {} without a body", path);
        }
        State::FencedBody {
            path,
            header_line,
            body,
            ..
        } => {
            tracing::debug!("Unterminated fence for {}; taking the rest of the reply", path);
            scan.files.push(FileEntry {
                header_line,
                path,
                content: finish_body(&body),
            })
        }
        State::PlainBody {
            path,
            header_line,
            body,
            ..
        } => scan.files.push(FileEntry {
            header_line,
            path,
            content: finish_body(&body),
        }),
    }

    scan
}

/// First line of the structured block, or `None` when the reply has no file header.
fn block_start(lines: &[&str], scan: &Scan) -> Option<usize> {
    let first_header = scan.files.iter().map(|f| f.header_line).min()?;
    let mut start = scan
        .commits
        .iter()
        .map(|(line, _)| *line)
        .filter(|line| *line < first_header)
        .max()
        .unwrap_or(first_header);

    // Pull in a branch line (and blank spacing) sitting directly above the boundary.
    let is_marker_line = |idx: usize| {
        scan.commits.iter().any(|(l, _)| *l == idx) || scan.branches.iter().any(|(l, _)| *l == idx)
    };
    while start > 0 && (lines[start - 1].trim().is_empty() || is_marker_line(start - 1)) {
        start -= 1;
    }
    Some(start)
}

/// Returns the change set embedded in `reply`, or `None` when there is no file header
/// outside example code.
pub fn extract_change_set(reply: &str) -> Option<ChangeSet> {
    let lines: Vec<&str> = reply.lines().collect();
    let scan = scan(&lines);
    let start = block_start(&lines, &scan)?;

    let mut change_set = ChangeSet {
        commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
        branch: None,
        files: IndexMap::new(),
    };
    for entry in scan.files.iter().filter(|f| f.header_line >= start) {
        change_set.insert_file(entry.path.clone(), entry.content.clone());
    }
    if change_set.files.is_empty() {
        return None;
    }

    let first_header = scan.files.iter().map(|f| f.header_line).min().unwrap_or(start);
    let commit = scan
        .commits
        .iter()
        .filter(|(line, _)| *line >= start && *line < first_header)
        .last()
        .or_else(|| scan.commits.iter().find(|(line, _)| *line >= start));
    if let Some((_, message)) = commit {
        if !is_placeholder(message) {
            change_set.commit_message = message.clone();
        }
    }

    change_set.branch = scan
        .branches
        .iter()
        .filter(|(line, _)| *line >= start)
        .map(|(_, value)| value.trim_start_matches("refs/heads/").to_string())
        .find(|value| !is_placeholder(value));

    tracing::debug!(
        "Extracted change set: {} file(s), commit {:?}, branch {:?}",
        change_set.files.len(),
        change_set.commit_message,
        change_set.branch
    );
    Some(change_set)
}

/// Prose preceding the change block, for display. Falls back to a generic
/// placeholder when nothing precedes the block.
pub fn strip_change_block(reply: &str, change_set: Option<&ChangeSet>) -> String {
    if change_set.is_none() {
        return reply.trim_end().to_string();
    }
    let lines: Vec<&str> = reply.lines().collect();
    let scan = scan(&lines);
    let prose = match block_start(&lines, &scan) {
        Some(start) => lines[..start].join("\n"),
        None => reply.to_string(),
    };
    let prose = prose.trim_end();
    if prose.trim().is_empty() {
        CHANGES_APPLIED_PLACEHOLDER.to_string()
    } else {
        prose.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(cs: &ChangeSet) -> Vec<(&str, &str)> {
        cs.files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect()
    }

    #[test]
    fn test_marker_classification_tolerates_markdown() {
        assert_eq!(
            classify_marker("**FILE:** `./src/app.js`"),
            Some(Marker::FileHeader("src/app.js".into()))
        );
        assert_eq!(
            classify_marker("### File: web/index.html"),
            Some(Marker::FileHeader("web/index.html".into()))
        );
        assert_eq!(
            classify_marker("**Commit message**: Fix build"),
            Some(Marker::Commit("Fix build".into()))
        );
        assert_eq!(classify_marker("Branch: `fix/build`"), Some(Marker::Branch("fix/build".into())));
        assert_eq!(classify_marker("FILE: ../etc/passwd"), None);
        assert_eq!(classify_marker("FILE:"), None);
        assert_eq!(classify_marker("Profile: nope"), None);
    }

    #[test]
    fn test_fence_info() {
        assert_eq!(fence_info("```"), Some(""));
        assert_eq!(fence_info("  ```tsx"), Some("tsx"));
        assert_eq!(fence_info("~~~"), Some(""));
        assert_eq!(fence_info("not a fence"), None);
    }

    #[test]
    fn test_end_to_end_readme() {
        let reply = "I'll add a README.\n\nCommit message: add readme\nFILE: README.md\n```\nhello\n```\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(cs.commit_message, "add readme");
        assert_eq!(files(&cs), vec![("README.md", "hello")]);
        assert_eq!(strip_change_block(reply, Some(&cs)), "I'll add a README.");
    }

    #[test]
    fn test_plain_body_stops_at_next_marker_and_trims_blank_tail() {
        let reply = "FILE: a.txt\nline 1\n\nline 3\n\n\nFILE: b.txt\nonly\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("a.txt", "line 1\n\nline 3"), ("b.txt", "only")]);
        assert_eq!(cs.commit_message, DEFAULT_COMMIT_MESSAGE);
    }

    #[test]
    fn test_nested_fence_inside_file_body() {
        let reply = "FILE: README.md\n```markdown\n# Title\n```bash\nnpm i\n```\nend\n```\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("README.md", "# Title\n```bash\nnpm i\n```\nend")]);
    }

    #[test]
    fn test_unterminated_fence_takes_rest() {
        let cs = match extract_change_set("FILE: x.js\n```js\nconst a = 1;\n\n") {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("x.js", "const a = 1;")]);
    }

    #[test]
    fn test_header_without_body_is_not_a_file() {
        assert_eq!(extract_change_set("Here you go:\nFILE: src/app.js\n"), None);
        assert_eq!(extract_change_set("FILE: a.js\nCommit message: fix\n"), None);
    }

    #[test]
    fn test_trailing_header_mention_keeps_real_body() {
        let reply = "FILE: a.js\n```\nreal code\n```\nThat edits the file below.\nFILE: a.js\n\nCommit message: fix\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("a.js", "real code")]);
        assert_eq!(cs.commit_message, "fix");
    }

    #[test]
    fn test_header_inside_example_fence_is_ignored() {
        let reply = "Use this format:\n```\nFILE: path/to/file\ncontent\n```\nThen I will apply it.";
        assert_eq!(extract_change_set(reply), None);
    }

    #[test]
    fn test_repeated_path_keeps_second_body() {
        let reply = "FILE: a\n```\nfirst\n```\nFILE: a\n```\nsecond\n```\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("a", "second")]);
    }

    #[test]
    fn test_fenced_body_keeps_blank_lines_verbatim() {
        let reply = "FILE: a.py\n```python\ndef f():\n\n    return 1\n\n\nx = 2\n```\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("a.py", "def f():\n\n    return 1\n\n\nx = 2")]);
    }

    #[test]
    fn test_distinct_headers_keep_reply_order() {
        let reply = "FILE: c.txt\n```\n3\n```\nFILE: a.txt\n```\n1\n```\nFILE: b.txt\n```\n2\n```\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(files(&cs), vec![("c.txt", "3"), ("a.txt", "1"), ("b.txt", "2")]);
    }

    #[test]
    fn test_strip_without_prose_uses_placeholder() {
        let reply = "Commit message: tidy\nFILE: a\n```\nx\n```\n";
        let cs = extract_change_set(reply);
        assert!(cs.is_some());
        assert_eq!(strip_change_block(reply, cs.as_ref()), CHANGES_APPLIED_PLACEHOLDER);
    }

    #[test]
    fn test_branch_above_block_is_captured_and_stripped() {
        let reply = "Intro.\n\nBranch: feat/x\nCommit message: add\nFILE: a\n```\nx\n```\n";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(cs.branch.as_deref(), Some("feat/x"));
        assert_eq!(cs.commit_message, "add");
        assert_eq!(strip_change_block(reply, Some(&cs)), "Intro.");
    }

    #[test]
    fn test_placeholder_commit_and_branch() {
        let reply = "Commit message: <short summary>\nBranch: <branch>\nFILE: a\n```\nx\n```";
        let cs = match extract_change_set(reply) {
            Some(cs) => cs,
            None => panic!("Expected a change set"),
        };
        assert_eq!(cs.commit_message, DEFAULT_COMMIT_MESSAGE);
        assert_eq!(cs.branch, None);
    }
}
