/// Start words and their stop counterparts, in matching priority.
const REPLACEMENTS: [(&str, &str); 9] = [
    ("start", "stop"),
    ("Start", "Stop"),
    ("START", "STOP"),
    ("run", "stop"),
    ("Run", "Stop"),
    ("RUN", "STOP"),
    ("exec", "stop"),
    ("Exec", "Stop"),
    ("EXEC", "STOP"),
];

/// Create a human-readable name for the action stopping a fork, given the
/// name the fork was started under.
///
/// `startFoo` -> `stopFoo`, `runJob` -> `stopJob`,
/// `execPoodleDaemon` -> `stopPoodleDaemon`, `joseph` -> `joseph_stop`.
pub fn stop_name_for(start_name: &str) -> String {
    REPLACEMENTS
        .iter()
        .find(|(word, _)| start_name.starts_with(word) || start_name.ends_with(word))
        .map(|(word, replacement)| replace_word(start_name, word, replacement))
        .unwrap_or_else(|| format!("{}_stop", start_name))
}

fn replace_word(name: &str, word: &str, replacement: &str) -> String {
    let mut replaced = match name.strip_prefix(word) {
        Some(rest) => format!("{}{}", replacement, rest),
        None => name.to_string(),
    };
    if let Some(rest) = replaced.strip_suffix(word) {
        replaced = format!("{}{}", rest, replacement);
    }
    replaced
}
