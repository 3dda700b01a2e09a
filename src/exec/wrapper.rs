//! Command wrapper seam: how an interpreter invocation becomes the actual
//! child command.
//!
//! The default wrapper runs scripts inside a hermetic `nix develop`
//! environment that keeps only an allow-listed set of variables; `--without-nix`
//! swaps in the direct wrapper, which runs the interpreter as-is and inherits
//! the parent environment.

use std::collections::BTreeSet;
use std::process::Command;

/// Builds the child command for a rendered script.
pub trait CommandWrapper: Send + Sync {
    /// `base` is the interpreter invocation (e.g. `["bash", "<script>"]`);
    /// `keep_vars` is the union of globally passed-through variables and the
    /// action's declared required variables.
    fn build(&self, base: &[String], keep_vars: &BTreeSet<String>) -> Command;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Hermetic wrapper: `nix develop --ignore-environment --keep VAR… --command …`.
#[derive(Debug, Default)]
pub struct HermeticWrapper;

impl CommandWrapper for HermeticWrapper {
    fn build(&self, base: &[String], keep_vars: &BTreeSet<String>) -> Command {
        let mut cmd = Command::new("nix");
        cmd.arg("develop").arg("--ignore-environment");
        for var in keep_vars {
            cmd.arg("--keep").arg(var);
        }
        cmd.arg("--command");
        cmd.args(base);
        cmd
    }

    fn name(&self) -> &'static str {
        "nix"
    }
}

/// Direct wrapper: run the interpreter, inherit the parent environment.
#[derive(Debug, Default)]
pub struct DirectWrapper;

impl CommandWrapper for DirectWrapper {
    fn build(&self, base: &[String], _keep_vars: &BTreeSet<String>) -> Command {
        let mut cmd = Command::new(&base[0]);
        cmd.args(&base[1..]);
        cmd
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Interpreter invocation for a rendered script.
pub fn interpreter_command(
    language: crate::core::types::Language,
    script_path: &std::path::Path,
) -> Vec<String> {
    let interpreter = match language {
        crate::core::types::Language::Bash => "bash",
        crate::core::types::Language::Python => "python3",
    };
    vec![
        interpreter.to_string(),
        script_path.display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Language;
    use std::path::Path;

    fn base() -> Vec<String> {
        interpreter_command(Language::Bash, Path::new("/run/a/script.sh"))
    }

    #[test]
    fn hermetic_wrapper_keeps_allowed_vars() {
        let keep: BTreeSet<String> = ["HOME".to_string(), "TOKEN".to_string()].into();
        let cmd = HermeticWrapper.build(&base(), &keep);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(cmd.get_program().to_string_lossy(), "nix");
        assert_eq!(
            args,
            vec![
                "develop",
                "--ignore-environment",
                "--keep",
                "HOME",
                "--keep",
                "TOKEN",
                "--command",
                "bash",
                "/run/a/script.sh",
            ]
        );
    }

    #[test]
    fn direct_wrapper_runs_interpreter_as_is() {
        let cmd = DirectWrapper.build(&base(), &BTreeSet::new());
        assert_eq!(cmd.get_program().to_string_lossy(), "bash");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["/run/a/script.sh"]);
    }

    #[test]
    fn python_uses_python3() {
        let base = interpreter_command(Language::Python, Path::new("/x/script.py"));
        assert_eq!(base[0], "python3");
    }
}
