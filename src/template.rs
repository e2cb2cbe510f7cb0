//! Rendering of configuration file templates with `{name}` placeholders.

use std::collections::BTreeMap;

/// Values for the placeholders of a template, by name.
pub type Vars<'a> = BTreeMap<&'a str, String>;

/// Replace every `{name}` in `template` with the value of `name` in `vars`. Placeholders that have
/// no value, and braces that do not enclose a name (e.g. `${PATH}` stays as is unless `PATH` has a
/// value), are left untouched. Values are inserted as is and are never expanded themselves.
pub fn render(template: &str, vars: &Vars<'_>) -> String {
    render_with(template, vars, |value| value.to_owned())
}

/// Like `render`, but values are escaped for use in XML text.
pub fn render_xml(template: &str, vars: &Vars<'_>) -> String {
    render_with(template, vars, escape_xml)
}

pub fn escape_xml(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn render_with<E>(template: &str, vars: &Vars<'_>, escape: E) -> String
where
    E: Fn(&str) -> String,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('}') {
            Some(close) if is_name(&after[..close]) => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(value) => out.push_str(&escape(value)),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars() -> Vars<'static> {
        let mut vars = Vars::new();
        vars.insert("master", "node001".into());
        vars.insert("user", "alice".into());
        vars
    }

    #[test]
    fn substitutes_known_names() {
        assert_eq!(
            render("hdfs://{master}:9000 for {user}", &vars()),
            "hdfs://node001:9000 for alice"
        );
    }

    #[test]
    fn leaves_unknown_and_malformed_placeholders() {
        assert_eq!(render("${PATH}:{user}", &vars()), "${PATH}:alice");
        assert_eq!(render("{not a name} {", &vars()), "{not a name} {");
        assert_eq!(render("{{user}}", &vars()), "{alice}");
    }

    #[test]
    fn values_are_not_expanded() {
        let mut vars = vars();
        vars.insert("user", "{master}".into());
        assert_eq!(render("{user}", &vars), "{master}");
    }

    #[test]
    fn xml_values_are_escaped() {
        let mut vars = vars();
        vars.insert("user", "a&b<c>".into());
        assert_eq!(
            render_xml("<value>{user}</value>", &vars),
            "<value>a&amp;b&lt;c&gt;</value>"
        );
        assert_eq!(escape_xml(r#"'"'"#), "&apos;&quot;&apos;");
    }
}
