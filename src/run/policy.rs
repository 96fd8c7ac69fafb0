//! Authorization of cross-namespace Secret references.
//!
//! A Secret may only be used by a Waybill in another namespace when its
//! allowed-namespaces annotation carries a glob matching that namespace.
//! The policy is shared by the keyring and SSH provisioners.

use k8s_openapi::api::core::v1::Secret;

use crate::crd::Waybill;
use crate::Error;

/// Annotation listing the namespaces (as comma-separated globs) that may use
/// a Secret from outside their own namespace
pub const SECRET_ALLOWED_NAMESPACES_ANNOTATION: &str = "kube-applier.io/allowed-namespaces";

/// Check whether the provided Secret can be used by the Waybill
pub fn check_secret_is_allowed(waybill: &Waybill, secret: &Secret) -> Result<(), Error> {
    let secret_namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
    let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
    if secret_namespace == waybill.namespace() {
        return Ok(());
    }
    let allowed = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SECRET_ALLOWED_NAMESPACES_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();
    for pattern in allowed.split(',') {
        if glob_match(pattern.trim(), waybill.namespace()) {
            return Ok(());
        }
    }
    Err(Error::secret(format!(
        r#"secret "{}/{}" cannot be used in namespace "{}", the namespace must be listed in the '{}' annotation"#,
        secret_namespace,
        secret_name,
        waybill.namespace(),
        SECRET_ALLOWED_NAMESPACES_ANNOTATION
    )))
}

/// Shell-style glob match over a namespace name: `*` matches any sequence,
/// `?` any single character, `[...]` a character class with ranges and `^`
/// negation, `\` escapes the next character.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_here(&pattern, &name)
}

fn match_here(pattern: &[char], name: &[char]) -> bool {
    let Some(&p) = pattern.first() else {
        return name.is_empty();
    };
    match p {
        '*' => (0..=name.len()).any(|i| match_here(&pattern[1..], &name[i..])),
        '?' => !name.is_empty() && match_here(&pattern[1..], &name[1..]),
        '[' => {
            let Some(&c) = name.first() else {
                return false;
            };
            match match_class(&pattern[1..], c) {
                Some((true, consumed)) => match_here(&pattern[1 + consumed..], &name[1..]),
                _ => false,
            }
        }
        '\\' => {
            pattern.len() >= 2
                && !name.is_empty()
                && pattern[1] == name[0]
                && match_here(&pattern[2..], &name[1..])
        }
        _ => !name.is_empty() && p == name[0] && match_here(&pattern[1..], &name[1..]),
    }
}

/// Match a character class; `class` starts after the opening bracket.
/// Returns whether the character matched and how many pattern characters
/// were consumed, including the closing bracket. Unterminated classes never
/// match.
fn match_class(class: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 0;
    let negated = class.first() == Some(&'^');
    if negated {
        i = 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < class.len() && (first || class[i] != ']') {
        first = false;
        let lo = class[i];
        if i + 2 < class.len() && class[i + 1] == '-' && class[i + 2] != ']' {
            let hi = class[i + 2];
            if lo <= c && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if c == lo {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= class.len() {
        return None;
    }
    Some((matched != negated, i + 1))
}
