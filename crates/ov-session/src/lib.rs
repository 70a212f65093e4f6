//! Session log and memory distillation for the OpenViking context
//! engine.

pub mod memory;
pub mod session;
pub mod store;

pub use memory::{MemoryCandidate, MemoryExtractor};
pub use session::{CommitResult, Message, Role, SessionRecord, SessionState};
pub use store::{CommitState, SessionStore};

/// Lower-case slug for memory file names.
pub fn slugify_text(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "memory".into()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_text() {
        assert_eq!(slugify_text("User lives in Berlin."), "user-lives-in-berlin");
        assert_eq!(slugify_text("!!!"), "memory");
        assert_eq!(slugify_text("Ünïcode Données"), "ünïcode-données");
    }
}
