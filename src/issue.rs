use colored::Colorize;

/// Severity of an [`Issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueLevel {
    Error,
    Warning,
}

/// A diagnostic of the most recent compile attempt.
///
/// Errors block compilation, warnings do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Issue {
    pub level: IssueLevel,
    /// 1-based statement position in the function body.
    pub line: usize,
    pub message: String,
}

impl Issue {
    pub fn error(line: usize, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            line,
            message: message.into(),
        }
    }

    pub fn warning(line: usize, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            line,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == IssueLevel::Error
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            IssueLevel::Error => "error".red().bold(),
            IssueLevel::Warning => "warning".yellow().bold(),
        };
        write!(f, "{level} at line {}: {}", self.line, self.message)
    }
}
