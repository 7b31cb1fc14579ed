//! Command classification.
//!
//! A command line is reduced to its program name (skipping `VAR=value`
//! assignments, `sudo`/`env`/`exec` wrappers and directory prefixes) and looked
//! up in three allow-lists. A few programs only stream when given a follow
//! flag, so those are matched on their arguments too.

use rustc_hash::FxHashSet;
use serde::Serialize;
use settings::CommandSettings;

/// How a command runs, which decides how it is supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandClass {
    /// Runs to completion on its own.
    OneShot,
    /// Streams until stopped; stoppable but not keystroke-interactive.
    Continuous,
    /// Needs a full pty with raw keystrokes.
    Interactive,
}

/// Kind of interactive program, used for display and session bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractiveKind {
    Editor,
    Monitor,
    Pager,
    Watcher,
    Multiplexer,
    Other,
}

const ONE_SHOT: &[&str] = &[
    "ls", "pwd", "whoami", "id", "hostname", "uname", "date", "uptime", "echo", "cat", "head",
    "wc", "df", "du", "free", "ps", "env", "which", "whereis", "file", "stat", "mkdir", "rmdir",
    "rm", "cp", "mv", "touch", "ln", "chmod", "chown", "grep", "find", "sort", "uniq", "cut",
    "diff", "git", "tar", "gzip", "gunzip", "zip", "unzip", "curl", "wget", "kill", "clear",
    "history", "cd",
];

const CONTINUOUS: &[&str] = &[
    "top", "watch", "ping", "ping6", "tcpdump", "iostat", "mpstat", "sar", "yes", "nload",
    "speedometer",
];

const EDITORS: &[&str] = &["vi", "vim", "nvim", "nano", "emacs", "pico", "micro"];
const MONITORS: &[&str] = &["htop", "btop", "atop", "iotop", "glances", "nmon", "iftop"];
const PAGERS: &[&str] = &["less", "more", "most", "man"];
const WATCHERS: &[&str] = &["lnav", "multitail"];
const MULTIPLEXERS: &[&str] = &["tmux", "screen", "zellij", "byobu"];
const OTHER_INTERACTIVE: &[&str] = &[
    "ssh", "mc", "ranger", "nnn", "tig", "gitui", "mutt", "alpine", "mysql", "psql", "sqlite3",
    "redis-cli", "ftp", "sftp", "telnet",
];

/// Interpreters that open a REPL when started without arguments.
const REPLS: &[&str] = &["python", "python3", "node", "irb", "ghci", "lua", "bc"];

/// Programs that stream only when given one of the listed flags.
const FOLLOW_FLAGS: &[(&str, &[&str])] = &[
    ("tail", &["-f", "-F", "--follow"]),
    ("journalctl", &["-f", "--follow"]),
    ("dmesg", &["-w", "--follow"]),
    ("logs", &["-f", "--follow"]),
];

/// Wrappers that are skipped when looking for the real program.
const WRAPPERS: &[&str] = &["sudo", "env", "exec", "nohup", "time", "nice"];
const WRAPPER_VALUE_FLAGS: &[&str] = &["-u", "-g", "-C", "-n"];

/// Classifies command lines against extendable allow-lists.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    one_shot: FxHashSet<String>,
    continuous: FxHashSet<String>,
    interactive: FxHashSet<String>,
}

impl Default for CommandClassifier {
    fn default() -> Self {
        let set = |lists: &[&[&str]]| -> FxHashSet<String> {
            lists
                .iter()
                .flat_map(|l| l.iter())
                .map(|s| s.to_string())
                .collect()
        };
        Self {
            one_shot: set(&[ONE_SHOT]),
            continuous: set(&[CONTINUOUS]),
            interactive: set(&[
                EDITORS,
                MONITORS,
                PAGERS,
                WATCHERS,
                MULTIPLEXERS,
                OTHER_INTERACTIVE,
            ]),
        }
    }
}

impl CommandClassifier {
    /// Built-in lists extended with the user's `[commands]` settings.
    pub fn from_settings(settings: &CommandSettings) -> Self {
        let mut classifier = Self::default();
        for name in &settings.one_shot {
            classifier.add(CommandClass::OneShot, name);
        }
        for name in &settings.continuous {
            classifier.add(CommandClass::Continuous, name);
        }
        for name in &settings.interactive {
            classifier.add(CommandClass::Interactive, name);
        }
        classifier
    }

    /// Register `program` under `class`, moving it out of any other list.
    pub fn add(&mut self, class: CommandClass, program: &str) {
        let program = program.trim().to_string();
        if program.is_empty() {
            return;
        }
        self.one_shot.remove(&program);
        self.continuous.remove(&program);
        self.interactive.remove(&program);
        match class {
            CommandClass::OneShot => self.one_shot.insert(program),
            CommandClass::Continuous => self.continuous.insert(program),
            CommandClass::Interactive => self.interactive.insert(program),
        };
    }

    pub fn classify(&self, command: &str) -> CommandClass {
        let Some(invocation) = Invocation::parse(command) else {
            return CommandClass::OneShot;
        };
        let program = invocation.program;

        if self.interactive.contains(program) {
            return CommandClass::Interactive;
        }
        if self.continuous.contains(program) {
            return CommandClass::Continuous;
        }
        if REPLS.contains(&program) && invocation.args.is_empty() {
            return CommandClass::Interactive;
        }
        if invocation.follows() {
            return CommandClass::Continuous;
        }
        // Everything else, listed or not, runs to completion
        CommandClass::OneShot
    }

    /// Whether `program` is on the one-shot list.
    pub fn is_known_one_shot(&self, program: &str) -> bool {
        self.one_shot.contains(program)
    }
}

/// Map an interactive command to its kind.
pub fn interactive_kind(command: &str) -> InteractiveKind {
    let Some(invocation) = Invocation::parse(command) else {
        return InteractiveKind::Other;
    };
    let program = invocation.program;
    if EDITORS.contains(&program) {
        InteractiveKind::Editor
    } else if MONITORS.contains(&program) {
        InteractiveKind::Monitor
    } else if PAGERS.contains(&program) {
        InteractiveKind::Pager
    } else if WATCHERS.contains(&program) {
        InteractiveKind::Watcher
    } else if MULTIPLEXERS.contains(&program) {
        InteractiveKind::Multiplexer
    } else {
        InteractiveKind::Other
    }
}

/// The program name of a command line, without wrappers or path.
pub fn program_name(command: &str) -> Option<&str> {
    Invocation::parse(command).map(|i| i.program)
}

struct Invocation<'a> {
    program: &'a str,
    args: Vec<&'a str>,
}

impl<'a> Invocation<'a> {
    fn parse(command: &'a str) -> Option<Self> {
        // Only the first stage of a pipeline decides how it runs
        let first_stage = command.split(['|', ';', '&']).next()?;
        let mut words = first_stage.split_whitespace().peekable();
        let mut after_wrapper = false;

        while let Some(&word) = words.peek() {
            let is_assignment = word
                .split_once('=')
                .is_some_and(|(name, _)| !name.is_empty() && !name.starts_with('-'));
            if is_assignment {
                words.next();
            } else if WRAPPERS.contains(&word) {
                after_wrapper = true;
                words.next();
            } else if after_wrapper && word.starts_with('-') {
                // Wrapper flags, e.g. `sudo -u root` or `nice -n 10`
                words.next();
                if WRAPPER_VALUE_FLAGS.contains(&word) {
                    words.next();
                }
            } else {
                break;
            }
        }

        let raw = words.next()?;
        let program = raw.rsplit('/').next().filter(|p| !p.is_empty())?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// `tail -f`, `journalctl --follow`, `docker logs -f` and friends.
    fn follows(&self) -> bool {
        let subcommand = self.args.iter().find(|a| !a.starts_with('-')).copied();
        FOLLOW_FLAGS.iter().any(|(name, flags)| {
            let applies = self.program == *name || subcommand == Some(*name);
            applies && self.args.iter().any(|arg| flags.contains(arg))
        })
    }
}
