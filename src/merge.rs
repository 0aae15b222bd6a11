//! Merge suggestions for conflict resolution.
//!
//! Nothing here is applied automatically. A suggestion is shown to the user,
//! who may edit it and submit it as the `merged` resolution. Bodies are
//! diffed line by line; lines that differ are kept from both sides inside
//! conflict markers so no text is lost.

use similar::{ChangeTag, TextDiff};

use crate::gateway::RemoteNote;
use crate::models::{normalize_tags, Note, NotePatch};

pub const LOCAL_LABEL: &str = "THIS DEVICE";
pub const REMOTE_LABEL: &str = "SERVER";

/// Result of merging two bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// The merged text (may contain conflict markers)
    pub content: String,
    /// Number of conflict regions in the merge
    pub conflict_count: usize,
}

impl MergeResult {
    pub fn has_conflicts(&self) -> bool {
        self.conflict_count > 0
    }
}

fn flush_region(
    merged: &mut String,
    local_only: &mut Vec<&str>,
    remote_only: &mut Vec<&str>,
    local_label: &str,
    remote_label: &str,
) -> bool {
    if local_only.is_empty() && remote_only.is_empty() {
        return false;
    }
    // Pure additions on one side merge cleanly
    if local_only.is_empty() || remote_only.is_empty() {
        for line in local_only.drain(..).chain(remote_only.drain(..)) {
            merged.push_str(line);
        }
        return false;
    }

    merged.push_str(&format!("<<<<<<< {}\n", local_label));
    for line in local_only.drain(..) {
        merged.push_str(line);
        if !line.ends_with('\n') {
            merged.push('\n');
        }
    }
    merged.push_str("=======\n");
    for line in remote_only.drain(..) {
        merged.push_str(line);
        if !line.ends_with('\n') {
            merged.push('\n');
        }
    }
    merged.push_str(&format!(">>>>>>> {}\n", remote_label));
    true
}

/// Merge two versions of a body.
///
/// Equal lines are kept once, lines present on only one side are kept, and
/// regions changed on both sides are wrapped in conflict markers.
pub fn merge_content(local: &str, remote: &str, local_label: &str, remote_label: &str) -> MergeResult {
    if local == remote {
        return MergeResult {
            content: local.to_string(),
            conflict_count: 0,
        };
    }

    let diff = TextDiff::from_lines(local, remote);
    let mut merged = String::new();
    let mut conflict_count = 0;
    let mut local_only: Vec<&str> = Vec::new();
    let mut remote_only: Vec<&str> = Vec::new();

    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal => {
                if flush_region(
                    &mut merged,
                    &mut local_only,
                    &mut remote_only,
                    local_label,
                    remote_label,
                ) {
                    conflict_count += 1;
                }
                merged.push_str(change.value());
            }
            ChangeTag::Delete => local_only.push(change.value()),
            ChangeTag::Insert => remote_only.push(change.value()),
        }
    }
    if flush_region(
        &mut merged,
        &mut local_only,
        &mut remote_only,
        local_label,
        remote_label,
    ) {
        conflict_count += 1;
    }

    MergeResult {
        content: merged,
        conflict_count,
    }
}

/// A proposed `merged` resolution for a conflicting note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSuggestion {
    pub patch: NotePatch,
    /// Conflict regions left in the suggested body
    pub conflict_count: usize,
}

fn pick_text(local: &str, remote: &str, prefer_remote: bool) -> String {
    if local == remote || remote.trim().is_empty() {
        local.to_string()
    } else if local.trim().is_empty() || prefer_remote {
        remote.to_string()
    } else {
        local.to_string()
    }
}

/// Build a merge suggestion from both snapshots.
///
/// Title and color come from whichever side was edited last, tags are the
/// union (local order first), and the body is a line merge.
pub fn suggest_merge(local: &Note, remote: &RemoteNote) -> MergeSuggestion {
    let remote_newer = remote.updated_at > local.updated_at;
    let body = merge_content(&local.body, &remote.body, LOCAL_LABEL, REMOTE_LABEL);

    let mut tags = local.tags.clone();
    tags.extend(remote.tags.iter().cloned());

    MergeSuggestion {
        patch: NotePatch {
            title: Some(pick_text(&local.title, &remote.title, remote_newer)),
            body: Some(body.content),
            color: Some(pick_text(&local.color, &remote.color, remote_newer)),
            tags: Some(normalize_tags(tags)),
        },
        conflict_count: body.conflict_count,
    }
}

/// Get a human-readable diff between the local and server versions.
pub fn get_diff_preview(local: &Note, remote: &RemoteNote) -> String {
    let mut output = String::new();
    output.push_str("--- Local\n");
    output.push_str("+++ Remote\n");

    if local.title != remote.title {
        output.push_str(&format!("-title: {}\n+title: {}\n", local.title, remote.title));
    }
    if local.color != remote.color {
        output.push_str(&format!("-color: {}\n+color: {}\n", local.color, remote.color));
    }
    if local.tags != remote.tags {
        output.push_str(&format!(
            "-tags: {}\n+tags: {}\n",
            local.tags.join(", "),
            remote.tags.join(", ")
        ));
    }

    let diff = TextDiff::from_lines(&local.body, &remote.body);
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "-",
            ChangeTag::Insert => "+",
            ChangeTag::Equal => " ",
        };
        output.push_str(sign);
        output.push_str(change.value());
        if change.missing_newline() {
            output.push('\n');
        }
    }

    output
}
