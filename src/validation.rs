//! Input validation for note mutations.
//!
//! All validators return NoteSyncError::Validation on failure.

use uuid::Uuid;

use crate::error::{NoteSyncError, NoteSyncResult};
use crate::models::{NoteDraft, NotePatch};

pub const MAX_TITLE_LENGTH: usize = 500;
pub const MAX_BODY_LENGTH: usize = 100_000; // 100KB of text
pub const MAX_TAG_NAME_LENGTH: usize = 100;
pub const MAX_TAGS_PER_NOTE: usize = 50;
pub const MAX_COLOR_LENGTH: usize = 32;
pub const UUID_BYTES_LENGTH: usize = 16;

/// Validate and convert a UUID hex string to Uuid.
pub fn validate_uuid_hex(value: &str, field_name: &str) -> NoteSyncResult<Uuid> {
    // Accept both hyphenated and non-hyphenated formats
    let cleaned = value.replace('-', "");
    Uuid::parse_str(&cleaned).map_err(|e| {
        NoteSyncError::validation(field_name, format!("invalid UUID format: {}", e))
    })
}

/// Validate a note ID.
pub fn validate_note_id(note_id: &str) -> NoteSyncResult<Uuid> {
    validate_uuid_hex(note_id, "note_id")
}

/// Convert UUID bytes to a Uuid.
pub fn uuid_from_bytes(bytes: &[u8]) -> NoteSyncResult<Uuid> {
    if bytes.len() != UUID_BYTES_LENGTH {
        return Err(NoteSyncError::validation(
            "uuid",
            format!("must be {} bytes, got {}", UUID_BYTES_LENGTH, bytes.len()),
        ));
    }
    Uuid::from_slice(bytes)
        .map_err(|e| NoteSyncError::validation("uuid", format!("invalid UUID bytes: {}", e)))
}

/// Validate a note title. Empty titles are allowed.
pub fn validate_title(title: &str) -> NoteSyncResult<()> {
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(NoteSyncError::validation(
            "title",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_TITLE_LENGTH,
                title.chars().count()
            ),
        ));
    }
    if title.contains('\n') {
        return Err(NoteSyncError::validation("title", "cannot contain line breaks"));
    }
    Ok(())
}

/// Validate a note body.
pub fn validate_body(body: &str) -> NoteSyncResult<()> {
    if body.len() > MAX_BODY_LENGTH {
        return Err(NoteSyncError::validation(
            "body",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_BODY_LENGTH,
                body.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a color: `#rgb`, `#rrggbb`, or a palette name like `yellow`.
pub fn validate_color(color: &str) -> NoteSyncResult<()> {
    if let Some(hex) = color.strip_prefix('#') {
        if (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(());
        }
        return Err(NoteSyncError::validation(
            "color",
            format!("'{}' is not a #rgb or #rrggbb value", color),
        ));
    }

    if color.is_empty() || color.len() > MAX_COLOR_LENGTH {
        return Err(NoteSyncError::validation(
            "color",
            format!("palette name must be 1-{} characters", MAX_COLOR_LENGTH),
        ));
    }
    if !color.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(NoteSyncError::validation(
            "color",
            "palette name may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Validate a tag name.
///
/// Tag names must be non-empty after trimming and no longer than
/// MAX_TAG_NAME_LENGTH characters.
pub fn validate_tag_name(name: &str) -> NoteSyncResult<()> {
    let stripped = name.trim();

    if stripped.is_empty() {
        return Err(NoteSyncError::validation(
            "tags",
            "tag cannot be empty or whitespace only",
        ));
    }

    if stripped.len() > MAX_TAG_NAME_LENGTH {
        return Err(NoteSyncError::validation(
            "tags",
            format!(
                "tag cannot exceed {} characters (got {})",
                MAX_TAG_NAME_LENGTH,
                stripped.len()
            ),
        ));
    }

    Ok(())
}

/// Validate a tag list.
pub fn validate_tags(tags: &[String]) -> NoteSyncResult<()> {
    if tags.len() > MAX_TAGS_PER_NOTE {
        return Err(NoteSyncError::validation(
            "tags",
            format!("cannot have more than {} tags", MAX_TAGS_PER_NOTE),
        ));
    }
    tags.iter().try_for_each(|t| validate_tag_name(t))
}

/// Validate a new note.
pub fn validate_draft(draft: &NoteDraft) -> NoteSyncResult<()> {
    validate_title(&draft.title)?;
    validate_body(&draft.body)?;
    if draft.title.trim().is_empty() && draft.body.trim().is_empty() {
        return Err(NoteSyncError::validation(
            "note",
            "title and body cannot both be empty",
        ));
    }
    if let Some(color) = &draft.color {
        validate_color(color)?;
    }
    validate_tags(&draft.tags)
}

/// Validate a partial update.
pub fn validate_patch(patch: &NotePatch) -> NoteSyncResult<()> {
    if patch.is_empty() {
        return Err(NoteSyncError::validation("patch", "no fields to update"));
    }
    if let Some(title) = &patch.title {
        validate_title(title)?;
    }
    if let Some(body) = &patch.body {
        validate_body(body)?;
    }
    if let Some(color) = &patch.color {
        validate_color(color)?;
    }
    if let Some(tags) = &patch.tags {
        validate_tags(tags)?;
    }
    Ok(())
}
