//! Shell rendering of provisioning plans.
//!
//! Purely mechanical: every stage becomes a progress marker followed by its directives, each
//! guarded according to the stage policy. Nothing here decides what runs or in which order.

use crate::provisioning::{
    Directive, FailurePolicy, ProvisioningPlan, ProvisioningStage, KERNEL_VERSION,
};
use crate::template::FsKind;
use rbf_error::ProvisionCode;
use std::path::Path;

pub const DEFAULT_SHELL: &str = "/usr/bin/bash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOptions {
    /// Interpreter named in the shebang.
    pub shell: String,
    /// Every command appends its output here.
    pub log_file: String,
    /// Soft guards wait for the operator before continuing.
    pub interactive: bool,
}

impl ScriptOptions {
    pub fn new(log_file: impl Into<String>) -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            log_file: log_file.into(),
            interactive: true,
        }
    }

    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }
}

/// One text block per stage, in plan order.
pub fn render(plan: &ProvisioningPlan, opts: &ScriptOptions) -> Vec<String> {
    plan.stages()
        .iter()
        .map(|stage| render_stage(stage, opts).join("\n"))
        .collect()
}

/// Complete script: shebang, every stage block, `exit 0`.
pub fn render_script(plan: &ProvisioningPlan, opts: &ScriptOptions) -> String {
    let mut script = format!("#!{}\n\n", opts.shell);
    for block in render(plan, opts) {
        script.push_str(&block);
        script.push_str("\n\n");
    }
    script.push_str("exit 0\n");
    script
}

fn render_stage(stage: &ProvisioningStage, opts: &ScriptOptions) -> Vec<String> {
    let mut lines = vec![format!(
        "echo \"[INFO ]   $0 {}\"",
        escape_double(&stage.description)
    )];
    for directive in &stage.directives {
        render_guarded(directive, stage, opts, "", &mut lines);
    }
    lines
}

fn render_guarded(
    directive: &Directive,
    stage: &ProvisioningStage,
    opts: &ScriptOptions,
    indent: &str,
    lines: &mut Vec<String>,
) {
    if let Directive::ForEachKernel { modules_dir, body } = directive {
        lines.push(format!(
            "{indent}for {} in $(ls {} 2>/dev/null); do",
            KERNEL_VERSION.trim_start_matches('$'),
            path_word(modules_dir)
        ));
        let inner = format!("{indent}    ");
        for d in body {
            render_guarded(d, stage, opts, &inner, lines);
        }
        lines.push(format!("{indent}done"));
        return;
    }

    lines.extend(
        render_directive(directive, opts)
            .into_iter()
            .map(|l| format!("{indent}{l}")),
    );
    if directive.is_guarded() {
        lines.push(format!("{indent}{}", guard(stage, opts)));
    }
}

fn guard(stage: &ProvisioningStage, opts: &ScriptOptions) -> String {
    match stage.policy {
        FailurePolicy::Abort => hard_guard(stage.code),
        FailurePolicy::Warn => soft_guard(stage.code, opts.interactive),
    }
}

/// `if [ $? != 0 ]; then exit <code>; fi`
pub fn hard_guard(code: ProvisionCode) -> String {
    format!("if [ $? != 0 ]; then exit {}; fi", code.code())
}

/// Report the failure and, when interactive, wait for the operator.
pub fn soft_guard(code: ProvisionCode, interactive: bool) -> String {
    let report = format!("echo \"[WARN ]  {}\"", escape_double(&code.to_string()));
    if interactive {
        format!("if [ $? != 0 ]; then {report}; read -p \"Press Enter To Continue\"; fi")
    } else {
        format!("if [ $? != 0 ]; then {report}; fi")
    }
}

fn render_directive(directive: &Directive, opts: &ScriptOptions) -> Vec<String> {
    let log = format!("&>> {}", word(&opts.log_file));
    let cmd = |parts: Vec<String>| vec![format!("{} {}", parts.join(" "), log)];

    match directive {
        Directive::DetachLoop { device } => vec![format!(
            "if losetup {dev} {log}; then losetup -d {dev} {log}; fi",
            dev = word(device)
        )],
        Directive::Settle { seconds } => vec![format!("sleep {seconds}")],
        Directive::Fallocate { path, size } => cmd(vec![
            "fallocate".into(),
            "-l".into(),
            size.to_string(),
            path_word(path),
        ]),
        Directive::Parted { image, entries } => {
            let mut parts = vec![
                "parted".to_string(),
                "-s".into(),
                path_word(image),
                "unit".into(),
                "MiB".into(),
                "mklabel".into(),
                "msdos".into(),
            ];
            for e in entries {
                parts.push("mkpart".into());
                parts.push(e.kind.as_str().into());
                if let Some(fs) = e.fs {
                    parts.push(fs.into());
                }
                parts.push(e.begin.mb().to_string());
                parts.push(e.end.mb().to_string());
            }
            cmd(parts)
        }
        Directive::AttachLoop { device, image } => {
            cmd(vec!["losetup".into(), word(device), path_word(image)])
        }
        Directive::Partprobe { device } => cmd(vec!["partprobe".into(), word(device)]),
        Directive::RequireBlockDevice { device } => vec![format!(
            "[ -b {} ] || exit {}",
            word(device),
            ProvisionCode::PartitionDoesNotExist.code()
        )],
        Directive::Mkfs {
            fs,
            device,
            identifier,
        } => {
            let mut parts = vec![fs.format_tool().to_string()];
            match fs {
                FsKind::Vfat => parts.extend(["-n".into(), word(identifier)]),
                FsKind::Xfs => parts.extend(["-m".into(), format!("uuid={}", word(identifier))]),
                _ => parts.extend(["-U".into(), word(identifier)]),
            }
            parts.push(word(device));
            cmd(parts)
        }
        Directive::MakeDir { path } => cmd(vec!["mkdir".into(), "-p".into(), path_word(path)]),
        Directive::Mount { device, target } => {
            cmd(vec!["mount".into(), word(device), path_word(target)])
        }
        Directive::MountPseudo { fstype, target } => cmd(vec![
            "mount".into(),
            "-t".into(),
            (*fstype).into(),
            (*fstype).into(),
            path_word(target),
        ]),
        Directive::Unmount { target } => cmd(vec!["umount".into(), path_word(target)]),
        Directive::RemoveTree { path } => cmd(vec!["rm".into(), "-rf".into(), path_word(path)]),
        Directive::WriteFile {
            path,
            contents,
            append,
        } => heredoc(path, contents, *append),
        Directive::RpmInitDb { root } => cmd(vec![
            "rpm".into(),
            "--root".into(),
            path_word(root),
            "--initdb".into(),
        ]),
        Directive::Yum {
            repos,
            root,
            action,
            items,
        } => {
            let mut parts = vec![
                "yum".to_string(),
                "-y".into(),
                word("--disablerepo=*"),
                word(&format!("--enablerepo={}", repos.join(","))),
                format!("--installroot={}", path_word(root)),
                action.as_str().into(),
            ];
            parts.extend(items.iter().map(|i| word(i)));
            cmd(parts)
        }
        Directive::Copy {
            sources,
            dest,
            preserve,
        } => {
            let flags = if *preserve { "-rpv" } else { "-rv" };
            let mut parts = vec!["cp".to_string(), flags.into()];
            parts.extend(sources.iter().map(|s| path_word(s)));
            parts.push(path_word(dest));
            cmd(parts)
        }
        Directive::Sed { expression, file } => cmd(vec![
            "sed".into(),
            "-i".into(),
            word(expression),
            path_word(file),
        ]),
        Directive::RunHook { program, args } => {
            let mut parts = vec![program_word(program)];
            parts.extend(args.iter().map(|a| word(a)));
            cmd(parts)
        }
        Directive::Chroot {
            root,
            program,
            args,
        } => {
            let mut parts = vec!["chroot".to_string(), path_word(root), word(program)];
            parts.extend(args.iter().map(|a| word(a)));
            cmd(parts)
        }
        Directive::ForEachKernel { .. } => Vec::new(),
    }
}

/// `cat` heredoc. The body is literal except for the kernel version placeholder.
fn heredoc(path: &Path, contents: &str, append: bool) -> Vec<String> {
    let redirect = if append { ">>" } else { ">" };
    let delimiter = heredoc_delimiter(contents);
    let (opener, body) = if contents.contains(KERNEL_VERSION) {
        let escaped = contents
            .split(KERNEL_VERSION)
            .map(|part| {
                part.replace('\\', "\\\\")
                    .replace('$', "\\$")
                    .replace('`', "\\`")
            })
            .collect::<Vec<_>>()
            .join(KERNEL_VERSION);
        (delimiter.clone(), escaped)
    } else {
        (format!("'{delimiter}'"), contents.to_string())
    };
    let mut lines = vec![format!("cat {redirect} {} << {opener}", path_word(path))];
    lines.extend(body.lines().map(str::to_string));
    lines.push(delimiter);
    lines
}

/// `EOF`, lengthened until no line of `contents` could close the heredoc early.
fn heredoc_delimiter(contents: &str) -> String {
    let mut delimiter = String::from("EOF");
    while contents.lines().any(|line| line == delimiter) {
        delimiter.push('_');
    }
    delimiter
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Quote `s` for the shell unless it is made of plain characters only.
///
/// Words holding the kernel version placeholder are double quoted so the loop variable
/// still expands.
pub fn word(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_plain) {
        return s.to_string();
    }
    if s.contains(KERNEL_VERSION) {
        let parts = s
            .split(KERNEL_VERSION)
            .map(escape_double)
            .collect::<Vec<_>>();
        return format!("\"{}\"", parts.join(KERNEL_VERSION));
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn path_word(path: &Path) -> String {
    word(&path.to_string_lossy())
}

/// Relative hooks run from the invocation directory, never from `PATH`.
fn program_word(program: &Path) -> String {
    if program.is_relative() && !program.starts_with(".") && !program.starts_with("..") {
        return path_word(&Path::new(".").join(program));
    }
    path_word(program)
}

fn escape_double(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
}
