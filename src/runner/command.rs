//! Argument assembly for the two kinds of step command.

use std::path::{Path, PathBuf};

use crate::config::RunnerConfig;
use crate::workspace::{INVENTORY_FILE, VARS_FILE};

/// A fully assembled command line plus where to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

impl StepCommand {
    /// `<program> -i hosts [--extra-vars @vars/all.yml] [--extra-vars <extra>]
    /// [default flags] [cli args] <entry>`, always in that order.
    pub fn playbook(
        runner: &RunnerConfig,
        workdir: &Path,
        entry: &Path,
        extra_vars: &str,
        cli_args: &str,
    ) -> Self {
        let mut args = vec!["-i".to_string(), INVENTORY_FILE.to_string()];
        if workdir.join(VARS_FILE).is_file() {
            args.push("--extra-vars".to_string());
            args.push(format!("@{VARS_FILE}"));
        }
        let extra_vars = extra_vars.trim();
        if !extra_vars.is_empty() {
            args.push("--extra-vars".to_string());
            args.push(extra_vars.to_string());
        }
        args.extend(runner.default_flags.iter().cloned());
        args.extend(split_args(cli_args));
        args.push(entry.display().to_string());

        Self {
            program: runner.playbook_program.clone(),
            args,
            workdir: workdir.to_path_buf(),
        }
    }

    /// `<shell> <script>` for templated jobs.
    pub fn script(runner: &RunnerConfig, workdir: &Path, script: &Path) -> Self {
        Self {
            program: runner.script_shell.clone(),
            args: vec![script.display().to_string()],
            workdir: workdir.to_path_buf(),
        }
    }

    /// Human-readable command line for log headers.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Split a user-supplied argument string the way a POSIX shell would,
/// without expanding anything. Single quotes are literal, double quotes
/// allow backslash escapes of `"`, `\\`, `$` and `` ` ``, and a bare
/// backslash escapes the next character. An unterminated quote runs to the
/// end of the input.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => current.push('\\'),
                        },
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playbook_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vars")).unwrap();
        std::fs::write(dir.path().join(VARS_FILE), "a: \"1\"\n").unwrap();

        let cmd = StepCommand::playbook(
            &RunnerConfig::default(),
            dir.path(),
            Path::new("site.yml"),
            "env=prod",
            "--check  --diff",
        );
        assert_eq!(cmd.program, "ansible-playbook");
        assert_eq!(
            cmd.args,
            [
                "-i",
                "hosts",
                "--extra-vars",
                "@vars/all.yml",
                "--extra-vars",
                "env=prod",
                "-v",
                "--check",
                "--diff",
                "site.yml"
            ]
        );
    }

    #[test]
    fn test_optional_parts_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = StepCommand::playbook(
            &RunnerConfig::default(),
            dir.path(),
            Path::new("site.yml"),
            "  ",
            "",
        );
        assert_eq!(cmd.args, ["-i", "hosts", "-v", "site.yml"]);
        assert_eq!(cmd.display(), "ansible-playbook -i hosts -v site.yml");
    }

    #[test]
    fn test_quoted_cli_args_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = StepCommand::playbook(
            &RunnerConfig::default(),
            dir.path(),
            Path::new("site.yml"),
            "",
            r#"--tags "a b" --limit 'web 1'"#,
        );
        assert_eq!(
            cmd.args,
            ["-i", "hosts", "-v", "--tags", "a b", "--limit", "web 1", "site.yml"]
        );
    }

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("  --check\t--diff \n"), ["--check", "--diff"]);
        assert_eq!(split_args(r#"-e "x=\"1\"" -e 'y=$HOME'"#), ["-e", r#"x="1""#, "-e", "y=$HOME"]);
        assert_eq!(split_args(r"a\ b c"), ["a b", "c"]);
        assert_eq!(split_args(r#"--name="" next"#), ["--name=", "next"]);
        assert_eq!(split_args("''"), [""]);
        assert_eq!(split_args("--msg 'open"), ["--msg", "open"]);
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn test_script_uses_configured_shell() {
        let cmd = StepCommand::script(
            &RunnerConfig::default(),
            Path::new("/w"),
            Path::new("/w/scripts/deploy.sh"),
        );
        assert_eq!(cmd.display(), "bash /w/scripts/deploy.sh");
    }
}
