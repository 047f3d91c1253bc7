//! `=~`/`=~s///` opcode execution, delegating to `regex_bridge::RegexCache`.

use std::rc::Rc;

use crate::{regex_bridge::RegexCache, value::Value};

/// Matches `subject` against `pattern`. Returns the match's own boolean
/// result plus the per-group capture values (group 0 = whole match) the
/// VM stashes for any `$N` references that follow — a failed match clears
/// the group list rather than leaving a stale one from an earlier match.
///
/// The `n` modifier (`spec.md` §3.4) numeric-types each capture: a group
/// that parses as an integer becomes a `long` rather than a string, which
/// is what lets `$N instanceof long` hold without the pattern author
/// having to cast. A group that doesn't parse as a number is left as a
/// string regardless of `n`.
pub fn regex_match(cache: &RegexCache, subject: &Value, pattern: &str, modifiers: &str) -> Result<(Value, Vec<Value>), String> {
    let Value::Str(s) = subject else {
        return Err("=~ requires a String subject".into());
    };
    let subject_id = Rc::as_ptr(s) as *const () as usize;
    match cache.matches(subject_id, s, pattern, modifiers)? {
        Some(groups) => {
            let numeric = modifiers.contains('n');
            let values = groups
                .into_iter()
                .map(|g| match g {
                    None => Value::Null,
                    Some(text) => match (numeric, text.parse::<i64>()) {
                        (true, Ok(n)) => Value::Long(n),
                        _ => Value::Str(Rc::from(text.as_str())),
                    },
                })
                .collect();
            Ok((Value::Boolean(true), values))
        }
        None => Ok((Value::Boolean(false), Vec::new())),
    }
}

pub fn regex_subst(cache: &RegexCache, subject: &Value, pattern: &str, replacement: &str, modifiers: &str) -> Result<Value, String> {
    let Value::Str(s) = subject else {
        return Err("=~s/// requires a String subject".into());
    };
    let result = cache.substitute(s, pattern, replacement, modifiers)?;
    Ok(Value::Str(Rc::from(result.as_str())))
}
