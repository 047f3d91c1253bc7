//! Bridges Jactl's `=~`/`=~s///` regex operators onto the `regex` crate
//! (`spec.md` §3.4, §4.5). Scan state for the `g` (global, repeated-match)
//! modifier is keyed by the identity of the subject binding together with
//! the pattern text, per the Open Question resolution in `DESIGN.md`: a
//! scan resets whenever the enclosing frame/scope unwinds rather than
//! persisting across it.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use regex::{Regex, RegexBuilder};

#[derive(Default)]
pub struct RegexCache {
    compiled: RefCell<HashMap<(String, String), Rc<Regex>>>,
    /// `(subject pointer identity, pattern)` → byte offset to resume a `g`
    /// scan from.
    scan_state: RefCell<HashMap<(usize, String), usize>>,
}

fn build(pattern: &str, modifiers: &str) -> Result<Regex, regex::Error> {
    let mut builder = RegexBuilder::new(pattern);
    builder.case_insensitive(modifiers.contains('i'));
    builder.multi_line(modifiers.contains('m'));
    builder.dot_matches_new_line(modifiers.contains('s'));
    builder.build()
}

impl RegexCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str, modifiers: &str) -> Result<Rc<Regex>, String> {
        let key = (pattern.to_string(), modifiers.to_string());
        if let Some(re) = self.compiled.borrow().get(&key) {
            return Ok(Rc::clone(re));
        }
        let re = Rc::new(build(pattern, modifiers).map_err(|e| e.to_string())?);
        self.compiled.borrow_mut().insert(key, Rc::clone(&re));
        Ok(re)
    }

    /// Matches `subject` against `pattern`. With the `g` modifier, resumes
    /// from the stored scan offset for this `(subject identity, pattern)`
    /// pair and advances it; without `g`, always scans from the start.
    /// Capture group values are always returned as raw strings in order,
    /// group 0 first (the whole match); the `n` modifier's numeric
    /// coercion of each group happens downstream in `regex_ops::regex_match`,
    /// not here — `=~`'s own match result stays a plain `Boolean` either way.
    pub fn matches(&self, subject_id: usize, subject: &str, pattern: &str, modifiers: &str) -> Result<Option<Vec<Option<String>>>, String> {
        let re = self.get(pattern, modifiers)?;
        let start = if modifiers.contains('g') {
            *self.scan_state.borrow().get(&(subject_id, pattern.to_string())).unwrap_or(&0)
        } else {
            0
        };
        if start > subject.len() {
            return Ok(None);
        }
        match re.captures(&subject[start..]) {
            Some(caps) => {
                if modifiers.contains('g') {
                    let m = caps.get(0).unwrap();
                    let next = start + m.end().max(m.start() + 1);
                    self.scan_state.borrow_mut().insert((subject_id, pattern.to_string()), next);
                }
                let groups = caps.iter().map(|m| m.map(|m| m.as_str().to_string())).collect();
                Ok(Some(groups))
            }
            None => {
                if modifiers.contains('g') {
                    self.scan_state.borrow_mut().remove(&(subject_id, pattern.to_string()));
                }
                Ok(None)
            }
        }
    }

    pub fn reset_scan(&self, subject_id: usize, pattern: &str) {
        self.scan_state.borrow_mut().remove(&(subject_id, pattern.to_string()));
    }

    /// `=~s///`: replaces the first match (or all, with `g`) using `$1`
    /// back-reference syntax in `replacement`.
    pub fn substitute(&self, subject: &str, pattern: &str, replacement: &str, modifiers: &str) -> Result<String, String> {
        let re = self.get(pattern, modifiers)?;
        let rust_replacement = jactl_replacement_to_rust(replacement);
        Ok(if modifiers.contains('g') {
            re.replace_all(subject, rust_replacement.as_str()).into_owned()
        } else {
            re.replace(subject, rust_replacement.as_str()).into_owned()
        })
    }
}

/// Jactl uses `$1`/`$name`; `regex`'s replacement syntax is `${1}`/`${name}`
/// — translate the common `$N` form.
fn jactl_replacement_to_rust(replacement: &str) -> String {
    let mut out = String::new();
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut digits = String::new();
            while let Some(d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(*d);
                    chars.next();
                } else {
                    break;
                }
            }
            if !digits.is_empty() {
                out.push_str(&format!("${{{digits}}}"));
                continue;
            }
        }
        out.push(c);
    }
    out
}
