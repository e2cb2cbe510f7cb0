//! Useful macros.

/// Time the given operation and push `(label, duration)` to the given `Vec<(&str, Duration)>`.
/// Evaluates to the value of the operation.
macro_rules! time {
    ($timers:ident, $label:literal, $expr:expr) => {{
        let start = std::time::Instant::now();
        let result = $expr;
        $timers.push(($label, start.elapsed()));
        result
    }};
}

/// Given an ordered list of path components, join them with `/` into a path string.
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = String::from($first);

        $(
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&format!("{}", $part));
        )*

        path
    }}
}

/// Run a bunch of commands on the same node, in order. Returns early with the error of the first
/// command that fails.
macro_rules! with_node {
    ($node:expr => $($cmd:expr),+ $(,)?) => {{
        let cmds: Vec<String> = vec![$(String::from($cmd)),+];

        for cmd in cmds.iter() {
            $node.run(cmd)?;
        }
    }}
}

#[cfg(test)]
mod test {
    #[test]
    fn dir_joins_components() {
        let home = String::from("/usr/local/hadoop");
        assert_eq!(dir!(&home, "etc/hadoop", "core-site.xml"), "/usr/local/hadoop/etc/hadoop/core-site.xml");
        assert_eq!(dir!("/home/", "alice"), "/home/alice");
        assert_eq!(dir!("/opt"), "/opt");
    }

    #[test]
    fn time_records_label() {
        let mut timers = vec![];
        let x = time!(timers, "add", 1 + 1);
        assert_eq!(x, 2);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].0, "add");
    }
}
