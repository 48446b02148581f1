//! Built-in roles and prompt rules, used when the config defines none.

use super::{PromptRule, RoleDef};

pub const DEFAULT_ROLE: &str = "developer";

pub fn builtin_rules() -> Vec<PromptRule> {
    vec![
        PromptRule {
            id: "small_commits".into(),
            body: "Make small, focused commits with descriptive messages. Commit working \
                   states; never leave the tree broken at the end of a turn."
                .into(),
        },
        PromptRule {
            id: "verify_before_done".into(),
            body: "Run the project's build and tests before declaring work complete. \
                   Report failures you could not fix as issues."
                .into(),
        },
        PromptRule {
            id: "read_only".into(),
            body: "You must not modify, create, or delete source files. Investigate, \
                   report findings, and record issues or documents instead."
                .into(),
        },
        PromptRule {
            id: "review_focus".into(),
            body: "Review for correctness first, then for missing tests, then for \
                   clarity. File an issue for every defect you find."
                .into(),
        },
        PromptRule {
            id: "delegate_deliberately".into(),
            body: "Delegate self-contained tasks to sub-agents with clear acceptance \
                   criteria. Review each child's diff before merging it."
                .into(),
        },
    ]
}

pub fn builtin_roles() -> Vec<RoleDef> {
    vec![
        RoleDef {
            name: DEFAULT_ROLE.into(),
            title: "Developer".into(),
            identity: "You are a software developer working in this repository. You write \
                       and change code to move the project plan forward."
                .into(),
            description: "Implements features and fixes defects.".into(),
            can_write_code: true,
            rule_ids: vec!["small_commits".into(), "verify_before_done".into()],
        },
        RoleDef {
            name: "lead".into(),
            title: "Lead".into(),
            identity: "You are the lead developer. You break work down, delegate it to \
                       sub-agents, and integrate their results."
                .into(),
            description: "Plans and delegates; merges child work.".into(),
            can_write_code: true,
            rule_ids: vec!["delegate_deliberately".into(), "verify_before_done".into()],
        },
        RoleDef {
            name: "reviewer".into(),
            title: "Reviewer".into(),
            identity: "You are a code reviewer. You read recent changes critically and \
                       report problems without fixing them yourself."
                .into(),
            description: "Reviews changes; read-only.".into(),
            can_write_code: false,
            rule_ids: vec!["read_only".into(), "review_focus".into()],
        },
        RoleDef {
            name: "scout".into(),
            title: "Scout".into(),
            identity: "You are a scout. You explore unfamiliar parts of the codebase and \
                       write down what you learn for the agents who come after you."
                .into(),
            description: "Explores and documents; read-only.".into(),
            can_write_code: false,
            rule_ids: vec!["read_only".into()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_roles_reference_builtin_rules() {
        let rules = builtin_rules();
        for role in builtin_roles() {
            for id in &role.rule_ids {
                assert!(
                    rules.iter().any(|r| &r.id == id),
                    "role {} references unknown rule {id}",
                    role.name
                );
            }
        }
    }

    #[test]
    fn default_role_is_builtin_and_writable() {
        let role = builtin_roles()
            .into_iter()
            .find(|r| r.name == DEFAULT_ROLE)
            .unwrap();
        assert!(role.can_write_code);
    }
}
