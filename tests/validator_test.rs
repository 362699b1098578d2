//! Property tests for the static validator.

mod common;

use proptest::prelude::*;
use stratbox::domain::outcome::StrategyCode;
use stratbox::domain::script::modules::MODULE_NAMES;
use stratbox::domain::validator::{BLOCKED_NAMES, Validator};

fn check(source: &str) -> (bool, Option<String>) {
    let verdict = Validator::default().check(&StrategyCode::from(source));
    (verdict.is_valid, verdict.reason)
}

/// Places `snippet` at the top level, inside a function, or in a branch.
fn embed(snippet: &str, placement: u8) -> String {
    match placement % 4 {
        0 => format!("{snippet}\n"),
        1 => format!("def helper(x):\n    y = x\n    {snippet}\n    return y\n"),
        2 => format!("if len([1]) > 0:\n    pass\nelse:\n    {snippet}\n"),
        _ => format!("for i in range(3):\n    while False:\n        {snippet}\n"),
    }
}

fn identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}".prop_filter("not a keyword or blocked name", |s| {
        !BLOCKED_NAMES.contains(&s.as_str())
            && ![
                "and", "as", "assert", "async", "await", "break", "class", "continue", "def",
                "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
                "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
                "return", "try", "while", "with", "yield",
            ]
            .contains(&s.as_str())
    })
}

proptest! {
    #[test]
    fn blocked_calls_are_rejected_wherever_they_appear(
        index in 0..BLOCKED_NAMES.len(),
        placement in 0u8..4,
    ) {
        let name = BLOCKED_NAMES[index];
        let source = embed(&format!("z = {name}('x')"), placement);
        let (valid, reason) = check(&source);
        prop_assert!(!valid, "{source}");
        let reason = reason.unwrap_or_default();
        prop_assert!(reason.contains(&format!("'{name}'")), "{reason}");
    }

    #[test]
    fn blocked_references_are_rejected(index in 0..BLOCKED_NAMES.len(), placement in 0u8..4) {
        let name = BLOCKED_NAMES[index];
        let source = embed(&format!("z = [{name}]"), placement);
        let (valid, reason) = check(&source);
        prop_assert!(!valid);
        prop_assert!(reason.unwrap_or_default().starts_with("disallowed reference"));
    }

    #[test]
    fn unknown_module_imports_are_rejected(module in identifier(), placement in 0u8..4) {
        prop_assume!(!MODULE_NAMES.contains(&module.as_str()));
        let source = embed(&format!("import {module}"), placement);
        let (valid, reason) = check(&source);
        prop_assert!(!valid);
        let expected = format!("disallowed import '{module}'");
        prop_assert!(reason.unwrap_or_default().starts_with(&expected));
    }

    #[test]
    fn allow_listed_imports_with_safe_code_are_valid(
        index in 0..MODULE_NAMES.len(),
        var in identifier(),
        n in -1000i64..1000,
    ) {
        let module = MODULE_NAMES[index];
        let source = format!(
            "import {module}\n{var} = abs({n}) + len([1, 2])\ntrades = [max({var}, 1)]\n"
        );
        let (valid, reason) = check(&source);
        prop_assert!(valid, "{source}: {reason:?}");
    }

    #[test]
    fn dunder_attributes_are_rejected(attr in "__[a-z]{1,10}__", placement in 0u8..4) {
        let source = embed(&format!("z = [1].{attr}"), placement);
        let (valid, reason) = check(&source);
        prop_assert!(!valid);
        prop_assert!(reason.unwrap_or_default().starts_with("disallowed attribute access"));
    }

    #[test]
    fn validation_is_deterministic(source in "[a-z =()\\[\\]0-9.,\\n]{0,60}") {
        prop_assert_eq!(check(&source), check(&source));
    }
}
