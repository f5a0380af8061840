/// Physical names of checkpoint namespaces and entities
///
/// Every name embeds the session and activity ids as 32 lowercase hex digits, which
/// is also what lets the startup sweep recognize leftovers of crashed sessions.

use uuid::Uuid;

pub const REL_PREFIX: &str = "rel_";
pub const DOC_PREFIX: &str = "doc_";
pub const LPG_PREFIX: &str = "lpg_";
pub const TABLE_PREFIX: &str = "t_";
pub const COLLECTION_PREFIX: &str = "c_";

const HEX_LEN: usize = 32;

fn hex(id: &Uuid) -> String {
    id.simple().to_string()
}

/// `rel_<session>` or `doc_<session>`
pub fn namespace_name(prefix: &str, session: &Uuid) -> String {
    format!("{}{}", prefix, hex(session))
}

pub fn table_name(activity: &Uuid, output: usize) -> String {
    format!("{}{}_{}", TABLE_PREFIX, hex(activity), output)
}

/// Collections carry the session id too, since collection names are global per store
pub fn collection_name(session: &Uuid, activity: &Uuid, output: usize) -> String {
    format!("{}{}_{}_{}", COLLECTION_PREFIX, hex(session), hex(activity), output)
}

/// `lpg_<session>_<activity>_<output>`, also the name of the graph's own namespace
pub fn graph_name(session: &Uuid, activity: &Uuid, output: usize) -> String {
    format!("{}_{}_{}", namespace_name(LPG_PREFIX, session), hex(activity), output)
}

fn is_hex(s: &str) -> bool {
    s.len() == HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether a namespace name looks like one created by a storage manager
pub fn is_checkpoint_namespace(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix(REL_PREFIX).or_else(|| name.strip_prefix(DOC_PREFIX)) {
        return is_hex(rest);
    }
    if let Some(rest) = name.strip_prefix(LPG_PREFIX) {
        let parts: Vec<&str> = rest.split('_').collect();
        return parts.len() == 3
            && is_hex(parts[0])
            && is_hex(parts[1])
            && !parts[2].is_empty()
            && parts[2].bytes().all(|b| b.is_ascii_digit());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_embed_simple_uuids() {
        let session = Uuid::new_v4();
        let activity = Uuid::new_v4();

        let rel = namespace_name(REL_PREFIX, &session);
        assert_eq!(rel.len(), REL_PREFIX.len() + 32);
        assert!(!rel.contains('-'));

        assert_eq!(table_name(&activity, 2), format!("t_{}_2", activity.simple()));
        assert_eq!(
            collection_name(&session, &activity, 0),
            format!("c_{}_{}_0", session.simple(), activity.simple())
        );
    }

    #[test]
    fn test_generated_names_are_recognized() {
        let session = Uuid::new_v4();
        let activity = Uuid::new_v4();

        assert!(is_checkpoint_namespace(&namespace_name(REL_PREFIX, &session)));
        assert!(is_checkpoint_namespace(&namespace_name(DOC_PREFIX, &session)));
        assert!(is_checkpoint_namespace(&graph_name(&session, &activity, 13)));
    }

    #[test]
    fn test_user_namespaces_are_not_recognized() {
        assert!(!is_checkpoint_namespace("public"));
        assert!(!is_checkpoint_namespace("rel_sales"));
        assert!(!is_checkpoint_namespace("doc_0123456789abcdef0123456789abcdeZ"));
        assert!(!is_checkpoint_namespace(&format!("lpg_{}_{}_", "a".repeat(32), "b".repeat(32))));
        assert!(!is_checkpoint_namespace(&format!("lpg_{}", "a".repeat(32))));
    }
}
