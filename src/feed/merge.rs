use std::collections::HashSet;

use crate::storage::{MergePlan, ParsedPost};

/// Split freshly parsed posts into inserts and updates by GUID.
///
/// `known` holds the GUIDs already stored for the source. A GUID repeated
/// within the same batch is inserted once and updated afterwards, so the
/// last occurrence's content wins.
pub fn plan_merge(known: &HashSet<String>, posts: Vec<ParsedPost>) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut fresh = HashSet::new();

    for post in posts {
        if known.contains(&post.guid) || fresh.contains(&post.guid) {
            plan.updates.push(post);
        } else {
            fresh.insert(post.guid.clone());
            plan.inserts.push(post);
        }
    }

    plan
}
