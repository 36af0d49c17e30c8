//! Shell interpreter discovery.

const SHELL_NAMES: &[&str] = &["sh", "ash", "bash", "dash", "zsh", "ksh", "fish", "tcsh", "csh"];

/// Return `[shell, "-c"]` when `shell` is a recognized POSIX-style shell.
///
/// Only exact `/bin/<name>` or `/usr/bin/<name>` paths are accepted.
pub fn shell_args(shell: Option<&str>) -> Option<[String; 2]> {
    let shell = shell?;
    let name = shell
        .strip_prefix("/usr/bin/")
        .or_else(|| shell.strip_prefix("/bin/"))?;
    SHELL_NAMES
        .contains(&name)
        .then(|| [shell.to_string(), "-c".to_string()])
}

/// Look up `SHELL` in a captured `KEY=VALUE` environment snapshot.
pub fn shell_from_env<'a>(
    env: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Option<[String; 2]> {
    env.into_iter()
        .find(|(key, _)| *key == "SHELL")
        .and_then(|(_, value)| shell_args(Some(value)))
}
