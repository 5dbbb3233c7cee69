//! Minimal `{{var}}` template interpolation for instruction fragments.
//!
//! Supports plain variable substitution and a single level of
//! `{{#if var}}…{{else}}…{{/if}}` conditionals. A variable is truthy when it
//! is present and non-empty. Unknown variables render as the empty string.
//! Conditionals do not nest; the instruction templates this serves never
//! need that.

use std::collections::HashMap;

const IF_OPEN: &str = "{{#if ";
const ELSE_TAG: &str = "{{else}}";
const IF_CLOSE: &str = "{{/if}}";

/// Renders `template` with the given variables.
///
/// ```
/// use std::collections::HashMap;
/// use lumo_bridge_common::template::interpolate;
///
/// let mut vars = HashMap::new();
/// vars.insert("name", "lumo".to_string());
/// assert_eq!(interpolate("hi {{name}}", &vars), "hi lumo");
/// assert_eq!(interpolate("{{#if name}}yes{{else}}no{{/if}}", &vars), "yes");
/// ```
#[must_use]
pub fn interpolate(template: &str, vars: &HashMap<&str, String>) -> String {
    let resolved = resolve_conditionals(template, vars);
    substitute(&resolved, vars)
}

/// Resolves every `{{#if var}}…{{/if}}` block to its chosen branch.
fn resolve_conditionals(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find(IF_OPEN) {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + IF_OPEN.len()..];

        let Some(name_end) = after_open.find("}}") else {
            // Unterminated tag: emit verbatim and stop scanning.
            output.push_str(&rest[open..]);
            return output;
        };
        let var_name = after_open[..name_end].trim();
        let body_start = &after_open[name_end + 2..];

        let Some(close) = body_start.find(IF_CLOSE) else {
            output.push_str(&rest[open..]);
            return output;
        };
        let body = &body_start[..close];
        rest = &body_start[close + IF_CLOSE.len()..];

        let truthy = vars.get(var_name).is_some_and(|v| !v.is_empty());
        let branch = match body.split_once(ELSE_TAG) {
            Some((then_branch, else_branch)) => {
                if truthy {
                    then_branch
                } else {
                    else_branch
                }
            }
            None => {
                if truthy {
                    body
                } else {
                    ""
                }
            }
        };
        output.push_str(branch);
    }

    output.push_str(rest);
    output
}

/// Substitutes `{{var}}` tokens; unknown tokens render empty.
fn substitute(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let var_name = after_open[..close].trim();
                if let Some(value) = vars.get(var_name) {
                    output.push_str(value);
                }
                rest = &after_open[close + 2..];
            }
            None => {
                output.push_str(&rest[open..]);
                return output;
            }
        }
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, (*v).to_string())).collect()
    }

    #[test]
    fn substitutes_variables() {
        let v = vars(&[("prefix", "user:"), ("tools", "search, fetch")]);
        assert_eq!(
            interpolate("call {{prefix}}name with {{tools}}", &v),
            "call user:name with search, fetch"
        );
    }

    #[test]
    fn unknown_variables_render_empty() {
        assert_eq!(interpolate("a{{missing}}b", &HashMap::new()), "ab");
    }

    #[test]
    fn if_branch_on_presence_and_non_empty() {
        let template = "{{#if tools}}has tools{{else}}no tools{{/if}}";
        assert_eq!(
            interpolate(template, &vars(&[("tools", "x")])),
            "has tools"
        );
        assert_eq!(interpolate(template, &vars(&[("tools", "")])), "no tools");
        assert_eq!(interpolate(template, &HashMap::new()), "no tools");
    }

    #[test]
    fn if_without_else_renders_nothing_when_falsy() {
        assert_eq!(
            interpolate("a{{#if x}}body{{/if}}b", &HashMap::new()),
            "ab"
        );
    }

    #[test]
    fn variables_inside_branches_are_substituted() {
        let v = vars(&[("tools", "search"), ("prefix", "user:")]);
        assert_eq!(
            interpolate("{{#if tools}}use {{prefix}}{{tools}}{{/if}}", &v),
            "use user:search"
        );
    }

    #[test]
    fn multiple_conditionals() {
        let v = vars(&[("a", "1")]);
        assert_eq!(
            interpolate("{{#if a}}A{{/if}}-{{#if b}}B{{else}}no B{{/if}}", &v),
            "A-no B"
        );
    }

    #[test]
    fn unterminated_tags_emit_verbatim() {
        assert_eq!(interpolate("a{{open", &HashMap::new()), "a{{open");
        assert_eq!(
            interpolate("{{#if x}}never closed", &HashMap::new()),
            "{{#if x}}never closed"
        );
    }
}
