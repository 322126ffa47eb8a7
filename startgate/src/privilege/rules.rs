//! The closed allow-list of root operations.

use crate::errors::PrivilegeError;
use regex::Regex;
use std::fmt;
use std::path::Path;

/// Programs that grant further elevation or run arbitrary commands. A rule
/// naming one of them would make the allow-list transitive, so such rules
/// are refused outright.
pub const ELEVATION_TOOLS: &[&str] = &[
    "sudo", "su", "doas", "pkexec", "runuser", "setpriv", "chroot", "env", "sh", "bash", "dash",
    "zsh", "startgate",
];

/// Identity privileged commands run as.
pub const ROOT: &str = "root";

/// Matches one argument.
#[derive(Debug, Clone)]
pub enum ArgPattern {
    /// Exact match.
    Literal(String),
    /// Anchored regular expression.
    Pattern(Regex),
}

impl ArgPattern {
    /// Exact match.
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// Anchored regular expression: the whole argument must match.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the expression does not compile.
    pub fn regex(pattern: &str) -> Result<Self, PrivilegeError> {
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Self::Pattern)
            .map_err(|e| PrivilegeError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Returns true if `arg` matches.
    #[must_use]
    pub fn matches(&self, arg: &str) -> bool {
        match self {
            Self::Literal(value) => value == arg,
            Self::Pattern(regex) => regex.is_match(arg),
        }
    }
}

impl fmt::Display for ArgPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.write_str(value),
            Self::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

/// A program with an exact argument shape.
#[derive(Debug, Clone)]
pub struct CommandPattern {
    /// Program, matched exactly.
    pub program: String,
    /// One pattern per argument; arity must match.
    pub args: Vec<ArgPattern>,
}

impl CommandPattern {
    /// Returns true if `command` matches program, arity and every argument.
    #[must_use]
    pub fn matches(&self, command: &PrivilegedCommand) -> bool {
        self.program == command.program
            && self.args.len() == command.args.len()
            && self
                .args
                .iter()
                .zip(&command.args)
                .all(|(pattern, arg)| pattern.matches(arg))
    }
}

/// One permitted `(command pattern, invoker, target)` triple.
#[derive(Debug, Clone)]
pub struct PrivilegeRule {
    /// What may be run.
    pub pattern: CommandPattern,
    /// Who may ask.
    pub invoker: String,
    /// Who it runs as.
    pub target: String,
}

impl PrivilegeRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(
        invoker: impl Into<String>,
        target: impl Into<String>,
        program: impl Into<String>,
        args: Vec<ArgPattern>,
    ) -> Self {
        Self {
            pattern: CommandPattern {
                program: program.into(),
                args,
            },
            invoker: invoker.into(),
            target: target.into(),
        }
    }
}

/// A concrete request to run something as root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedCommand {
    /// Program.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl PrivilegedCommand {
    /// Creates a command.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for PrivilegedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A static, closed table of privilege rules. Anything not matched is denied.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    rules: Vec<PrivilegeRule>,
}

impl AllowList {
    /// Builds the table.
    ///
    /// # Errors
    ///
    /// Returns `ElevationRule` if any rule names an elevation tool or shell.
    pub fn new(rules: Vec<PrivilegeRule>) -> Result<Self, PrivilegeError> {
        if let Some(rule) = rules.iter().find(|r| is_elevation_tool(&r.pattern.program)) {
            return Err(PrivilegeError::ElevationRule {
                program: rule.pattern.program.clone(),
            });
        }
        Ok(Self { rules })
    }

    /// The table the container ships with: refreshing the CA trust store,
    /// callable by root and by the service identity.
    #[must_use]
    pub fn default_for(service_user: &str) -> Self {
        let rules = [ROOT, service_user]
            .into_iter()
            .map(|invoker| PrivilegeRule::new(invoker, ROOT, "update-ca-certificates", Vec::new()))
            .collect();
        Self { rules }
    }

    /// The rule permitting this call, if any.
    #[must_use]
    pub fn permits(&self, invoker: &str, target: &str, command: &PrivilegedCommand) -> Option<&PrivilegeRule> {
        self.rules
            .iter()
            .find(|r| r.invoker == invoker && r.target == target && r.pattern.matches(command))
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true for an empty (deny-all) table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The rules.
    #[must_use]
    pub fn rules(&self) -> &[PrivilegeRule] {
        &self.rules
    }
}

fn is_elevation_tool(program: &str) -> bool {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    ELEVATION_TOOLS.contains(&name)
}
