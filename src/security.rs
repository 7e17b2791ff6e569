//! Pre-execution validation for shell commands (§4.7). Mirrors the shape of
//! a bash pre-tool-use hook: split into segments, tokenize each with shell
//! quoting rules, extract the command name, check it against a fixed
//! allowlist, then run any extra per-command validation.

const ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "find", "cp", "mv", "mkdir", "touch", "rm",
    "chmod", "curl", "python", "python3", "node", "npm", "npx", "git", "ps", "lsof", "sleep",
    "pkill", "ruff", "mypy", "eslint", "tsc", "prettier", "black", "bash", "sh", "init.sh",
    "lint-gate.sh", "check-complexity.sh",
];

const NAMED_SCRIPTS: &[&str] = &["init.sh", "lint-gate.sh", "check-complexity.sh"];

const SYSTEM_ROOTS: &[&str] = &[
    "/", "/etc", "/usr", "/var", "/bin", "/sbin", "/lib", "/opt", "/boot", "/root", "/home",
    "/Users", "/System", "/Library", "/Applications", "/private",
];

const SHELL_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac",
    "in", "!", "{", "}",
];

const CHAIN_OPERATORS: &[&str] = &["|", "||", "&&", "&"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    fn allow() -> ValidationResult {
        ValidationResult {
            allowed: true,
            reason: None,
        }
    }

    fn block(reason: impl Into<String>) -> ValidationResult {
        ValidationResult {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Split `command` on `&&`, `||`, `;` that appear outside of quotes.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if in_double {
            current.push(c);
            if c == '"' {
                in_double = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = true;
                current.push(c);
            }
            ';' => {
                segments.push(std::mem::take(&mut current));
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Shell-word tokenization: respects single/double quotes, backslash
/// escapes outside single quotes. Returns `None` on unbalanced quoting.
fn tokenize(segment: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_current = false;
    let mut chars = segment.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            continue;
        }
        if in_double {
            match c {
                '"' => in_double = false,
                '\\' if matches!(chars.peek(), Some('"') | Some('\\') | Some('$')) => {
                    current.push(chars.next().unwrap());
                }
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                has_current = true;
            }
            '"' => {
                in_double = true;
                has_current = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_current = true;
                }
            }
            c if c.is_whitespace() => {
                if has_current {
                    tokens.push(std::mem::take(&mut current));
                    has_current = false;
                }
            }
            '|' | '&' => {
                if has_current {
                    tokens.push(std::mem::take(&mut current));
                    has_current = false;
                }
                let mut op = String::from(c);
                if chars.peek() == Some(&c) {
                    op.push(chars.next().unwrap());
                }
                tokens.push(op);
            }
            _ => {
                current.push(c);
                has_current = true;
            }
        }
    }

    if in_single || in_double {
        return None;
    }
    if has_current {
        tokens.push(current);
    }
    Some(tokens)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Walk a segment's tokens and collect the base names of every command
/// invoked in it: the first token, plus whatever follows a `|`/`||`/`&&`/`&`
/// operator, skipping flags and `VAR=value` assignments.
fn extract_commands_in_segment(tokens: &[String]) -> Vec<String> {
    let mut commands = Vec::new();
    let mut expect_command = true;

    for tok in tokens {
        if CHAIN_OPERATORS.contains(&tok.as_str()) {
            expect_command = true;
            continue;
        }
        if !expect_command {
            continue;
        }
        if SHELL_KEYWORDS.contains(&tok.as_str()) {
            continue;
        }
        if tok.starts_with('-') {
            continue;
        }
        if tok.contains('=') && tok.split('=').next().map_or(false, is_identifier) {
            continue;
        }
        commands.push(basename(tok).to_string());
        expect_command = false;
    }
    commands
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map_or(false, |c| c.is_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Extract every command name invoked anywhere in `command`. Returns `None`
/// if any segment has unbalanced quoting.
fn extract_commands(command: &str) -> Option<Vec<String>> {
    let mut all = Vec::new();
    for segment in split_segments(command) {
        let tokens = tokenize(&segment)?;
        all.extend(extract_commands_in_segment(&tokens));
    }
    Some(all)
}

fn flags_and_args(tokens: &[String]) -> (Vec<&str>, Vec<&str>) {
    let mut flags = Vec::new();
    let mut args = Vec::new();
    for tok in tokens.iter().skip(1) {
        if tok.starts_with('-') {
            flags.push(tok.as_str());
        } else {
            args.push(tok.as_str());
        }
    }
    (flags, args)
}

fn validate_rm(tokens: &[String]) -> ValidationResult {
    let (_, args) = flags_and_args(tokens);
    for target in args {
        if target.starts_with("/*") {
            return ValidationResult::block(format!("rm wildcard targeting root: {}", target));
        }
        let normalized = target.trim_end_matches('/');
        let normalized = if normalized.is_empty() { "/" } else { normalized };
        for root in SYSTEM_ROOTS {
            if normalized == *root {
                return ValidationResult::block(format!("rm targets system root: {}", target));
            }
            if *root != "/" {
                if let Some(rest) = normalized.strip_prefix(root) {
                    if rest.starts_with('/') && !rest[1..].contains('/') {
                        return ValidationResult::block(format!(
                            "rm targets path directly beneath system root: {}",
                            target
                        ));
                    }
                }
            } else if normalized.starts_with('/') && !normalized[1..].contains('/') && !normalized[1..].is_empty()
            {
                return ValidationResult::block(format!(
                    "rm targets path directly beneath system root: {}",
                    target
                ));
            }
        }
    }
    ValidationResult::allow()
}

fn validate_chmod(tokens: &[String]) -> ValidationResult {
    let (flags, args) = flags_and_args(tokens);
    if !flags.is_empty() {
        return ValidationResult::block("chmod with flags is not allowed");
    }
    if args.is_empty() {
        return ValidationResult::block("chmod requires a mode and at least one file argument");
    }
    let mode = args[0];
    let valid_mode = match mode.find('+') {
        Some(plus_idx) => {
            let prefix = &mode[..plus_idx];
            let suffix = &mode[plus_idx + 1..];
            prefix.chars().all(|c| matches!(c, 'u' | 'g' | 'o' | 'a')) && suffix == "x"
        }
        None => false,
    };
    if !valid_mode {
        return ValidationResult::block(format!("chmod mode not allowed: {}", mode));
    }
    if args.len() < 2 {
        return ValidationResult::block("chmod requires at least one file argument");
    }
    ValidationResult::allow()
}

fn validate_pkill(tokens: &[String]) -> ValidationResult {
    const ALLOWED: &[&str] = &["node", "npm", "npx", "vite", "next"];
    let (_, args) = flags_and_args(tokens);
    let target = match args.last() {
        Some(t) => *t,
        None => return ValidationResult::block("pkill requires a target argument"),
    };
    let first_word = target.split_whitespace().next().unwrap_or(target);
    let name = basename(first_word);
    if ALLOWED.contains(&name) {
        ValidationResult::allow()
    } else {
        ValidationResult::block(format!("pkill target not allowed: {}", target))
    }
}

fn validate_git(tokens: &[String]) -> ValidationResult {
    let args: Vec<&str> = tokens.iter().skip(1).map(|s| s.as_str()).collect();
    if args.is_empty() {
        return ValidationResult::allow();
    }

    let has = |needle: &str| args.iter().any(|a| *a == needle);
    let non_flag: Vec<&&str> = args.iter().filter(|a| !a.starts_with('-')).collect();

    match args[0] {
        "push" => {
            if (has("--force") || has("-f")) && args.iter().any(|a| *a == "main" || *a == "master")
            {
                return ValidationResult::block("git push --force to main/master is not allowed");
            }
        }
        "reset" => {
            if has("--hard") {
                return ValidationResult::block("git reset --hard is not allowed");
            }
        }
        "clean" => {
            if has("-f") || has("--force") {
                return ValidationResult::block("git clean -f is not allowed");
            }
        }
        "checkout" => {
            if non_flag.len() == 1 && *non_flag[0] == "." {
                return ValidationResult::block("git checkout . is not allowed");
            }
        }
        "restore" => {
            if non_flag.len() == 1 && *non_flag[0] == "." {
                return ValidationResult::block("git restore . is not allowed");
            }
        }
        "branch" => {
            if has("-D") {
                let has_agent_branch = args.iter().any(|a| a.starts_with("agent/"));
                if !has_agent_branch {
                    return ValidationResult::block(
                        "git branch -D is only allowed for agent/-prefixed branches",
                    );
                }
            }
        }
        _ => {}
    }
    ValidationResult::allow()
}

fn validate_named_script(tokens: &[String], script: &str) -> ValidationResult {
    let invoked = match tokens.first() {
        Some(t) => t.as_str(),
        None => return ValidationResult::block("empty command"),
    };
    let ok = invoked == format!("./{}", script)
        || invoked == format!("scripts/{}", script)
        || invoked.ends_with(&format!("/{}", script))
            && (invoked.starts_with('/') || invoked.starts_with("scripts/"));
    if ok {
        ValidationResult::allow()
    } else {
        ValidationResult::block(format!(
            "{} must be invoked as ./{} or scripts/{}",
            script, script, script
        ))
    }
}

/// Validate one already-tokenized invocation against the allowlist and any
/// sub-rule for its command name.
fn validate_tokens(tokens: &[String]) -> ValidationResult {
    let invoked = match tokens.first() {
        Some(t) => t.as_str(),
        None => return ValidationResult::block("empty command"),
    };
    let name = basename(invoked);

    if !ALLOWED_COMMANDS.contains(&name) {
        return ValidationResult::block(format!("command not in allowlist: {}", name));
    }

    match name {
        "rm" => validate_rm(tokens),
        "chmod" => validate_chmod(tokens),
        "pkill" => validate_pkill(tokens),
        "git" => validate_git(tokens),
        _ if NAMED_SCRIPTS.contains(&name) => validate_named_script(tokens, name),
        _ => ValidationResult::allow(),
    }
}

/// Entry point for the pre-execution hook: block on unparseable quoting,
/// on any segment invoking a disallowed command, or failing a sub-rule.
pub fn validate_command(command: &str) -> ValidationResult {
    if extract_commands(command).is_none() {
        return ValidationResult::block("could not parse command (unbalanced quoting)");
    }

    for segment in split_segments(command) {
        let tokens = match tokenize(&segment) {
            Some(t) => t,
            None => return ValidationResult::block("could not parse command (unbalanced quoting)"),
        };
        if tokens.is_empty() {
            continue;
        }

        let mut expect_command = true;
        let mut idx = 0;
        while idx < tokens.len() {
            let tok = &tokens[idx];
            if CHAIN_OPERATORS.contains(&tok.as_str()) {
                expect_command = true;
                idx += 1;
                continue;
            }
            if !expect_command {
                idx += 1;
                continue;
            }
            if SHELL_KEYWORDS.contains(&tok.as_str()) {
                idx += 1;
                continue;
            }
            if tok.starts_with('-') {
                idx += 1;
                continue;
            }
            if tok.contains('=') && tok.split('=').next().map_or(false, is_identifier) {
                idx += 1;
                continue;
            }

            let invocation = &tokens[idx..];
            let result = validate_tokens(invocation);
            if !result.allowed {
                return result;
            }
            expect_command = false;
            idx += 1;
        }
    }

    ValidationResult::allow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_plain_allowlisted_command() {
        assert!(validate_command("ls -la /tmp").allowed);
    }

    #[test]
    fn blocks_command_not_in_allowlist() {
        let r = validate_command("wget http://example.com");
        assert!(!r.allowed);
    }

    #[test]
    fn blocks_unbalanced_quoting() {
        let r = validate_command("echo \"unterminated");
        assert!(!r.allowed);
    }

    #[test]
    fn chained_commands_all_validated() {
        let r = validate_command("ls && wget http://x");
        assert!(!r.allowed);
    }

    #[test]
    fn rm_blocks_system_root() {
        assert!(!validate_command("rm -rf /etc").allowed);
        assert!(!validate_command("rm -rf /etc/passwd").allowed);
        assert!(!validate_command("rm -rf /*").allowed);
    }

    #[test]
    fn rm_allows_project_relative_path() {
        assert!(validate_command("rm -rf ./build/tmp").allowed);
    }

    #[test]
    fn chmod_only_allows_plus_x_no_flags() {
        assert!(validate_command("chmod +x init.sh").allowed);
        assert!(!validate_command("chmod -R +x init.sh").allowed);
        assert!(!validate_command("chmod 755 init.sh").allowed);
        assert!(!validate_command("chmod +x").allowed);
    }

    #[test]
    fn pkill_allows_dev_process_names_only() {
        assert!(validate_command("pkill node").allowed);
        assert!(validate_command("pkill -f vite").allowed);
        assert!(!validate_command("pkill ssh").allowed);
    }

    #[test]
    fn git_blocks_force_push_to_main() {
        assert!(!validate_command("git push --force origin main").allowed);
        assert!(validate_command("git push --force origin feature/x").allowed);
    }

    #[test]
    fn git_blocks_reset_hard_and_clean_force() {
        assert!(!validate_command("git reset --hard HEAD~1").allowed);
        assert!(!validate_command("git clean -f").allowed);
    }

    #[test]
    fn git_blocks_bare_checkout_dot_and_restore_dot() {
        assert!(!validate_command("git checkout .").allowed);
        assert!(!validate_command("git restore .").allowed);
        assert!(validate_command("git checkout main").allowed);
    }

    #[test]
    fn git_branch_delete_requires_agent_prefix() {
        assert!(!validate_command("git branch -D feature/x").allowed);
        assert!(validate_command("git branch -D agent/eng-1").allowed);
    }

    #[test]
    fn named_scripts_require_relative_invocation() {
        assert!(validate_command("./init.sh").allowed);
        assert!(validate_command("scripts/lint-gate.sh").allowed);
        assert!(!validate_command("init.sh").allowed);
    }
}
